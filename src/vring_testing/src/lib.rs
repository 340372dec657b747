/*
Copyright 2026  The vring Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Test doubles for `vring`: shared memory, a page allocator, a notifier
//! and a simulated device that plays the other end of the ring.

pub mod device;
pub mod memory;
pub mod simplelogger;

pub use device::{CountingNotifier, Request, SimDevice};
pub use memory::{PageAllocator, TestMemory};
pub use simplelogger::{LogCall, SimpleLogger};
