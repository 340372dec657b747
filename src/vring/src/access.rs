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

//! Shared Memory Access
//!
//! This module defines the [`MemOps`] trait through which the engine touches
//! ring memory and caller buffers. Ring memory may be uncached or sit behind
//! an IOMMU, so the engine never casts addresses to references; every access
//! goes through an explicit read, write or ordered index operation.

use core::sync::atomic::{Ordering, fence};

use bytemuck::Pod;

use crate::addr::{AddressTranslate, VirtAddr};

/// Scratch size used by the default [`MemOps::fill`] and [`MemOps::copy`].
const CHUNK: usize = 64;

/// Backend-provided memory access for the ring engine.
///
/// # Ordering contract
///
/// The ring protocol relies on exactly three ordering points:
///
/// - [`store_release`](Self::store_release) publishes an index; every write
///   issued before it must be visible to the device before the index is.
/// - [`load_acquire`](Self::load_acquire) observes an index; every read issued
///   after it must observe device writes made before the index was stored.
/// - [`full_barrier`](Self::full_barrier) orders a preceding index store
///   against a following read of device-owned notification state.
///
/// Plain [`read`](Self::read) and [`write`](Self::write) carry no ordering.
pub trait MemOps: AddressTranslate {
    type Error: core::fmt::Debug;

    /// Read bytes at a CPU address.
    ///
    /// Returns the number of bytes read (`dst.len()` on success).
    fn read(&self, addr: VirtAddr, dst: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write bytes at a CPU address.
    ///
    /// Returns the number of bytes written (`src.len()` on success).
    fn write(&self, addr: VirtAddr, src: &[u8]) -> Result<usize, Self::Error>;

    /// Load a little-endian u16 with acquire semantics.
    ///
    /// `addr` must be 2-byte aligned.
    fn load_acquire(&self, addr: VirtAddr) -> Result<u16, Self::Error>;

    /// Store a little-endian u16 with release semantics.
    ///
    /// `addr` must be 2-byte aligned.
    fn store_release(&self, addr: VirtAddr, val: u16) -> Result<(), Self::Error>;

    /// Full memory barrier.
    fn full_barrier(&self) {
        fence(Ordering::SeqCst);
    }

    /// Read a Pod value at the given address.
    fn read_val<T: Pod>(&self, addr: VirtAddr) -> Result<T, Self::Error> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    /// Write a Pod value at the given address.
    fn write_val<T: Pod>(&self, addr: VirtAddr, val: T) -> Result<(), Self::Error> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)?;
        Ok(())
    }

    /// Set `len` bytes starting at `addr` to `byte`.
    fn fill(&self, addr: VirtAddr, byte: u8, len: usize) -> Result<(), Self::Error> {
        let chunk = [byte; CHUNK];
        let mut done = 0;

        while done < len {
            let n = (len - done).min(CHUNK);
            self.write(addr.add(done as u64), &chunk[..n])?;
            done += n;
        }

        Ok(())
    }

    /// Copy `len` bytes from `src` to `dst`. The ranges must not overlap.
    fn copy(&self, src: VirtAddr, dst: VirtAddr, len: usize) -> Result<(), Self::Error> {
        let mut chunk = [0u8; CHUNK];
        let mut done = 0;

        while done < len {
            let n = (len - done).min(CHUNK);
            self.read(src.add(done as u64), &mut chunk[..n])?;
            self.write(dst.add(done as u64), &chunk[..n])?;
            done += n;
        }

        Ok(())
    }
}

macro_rules! forward_mem_ops {
    ($($ptr:ty),*) => {
        $(
            impl<T: MemOps + ?Sized> MemOps for $ptr {
                type Error = T::Error;

                fn read(&self, addr: VirtAddr, dst: &mut [u8]) -> Result<usize, Self::Error> {
                    (**self).read(addr, dst)
                }

                fn write(&self, addr: VirtAddr, src: &[u8]) -> Result<usize, Self::Error> {
                    (**self).write(addr, src)
                }

                fn load_acquire(&self, addr: VirtAddr) -> Result<u16, Self::Error> {
                    (**self).load_acquire(addr)
                }

                fn store_release(&self, addr: VirtAddr, val: u16) -> Result<(), Self::Error> {
                    (**self).store_release(addr, val)
                }

                fn full_barrier(&self) {
                    (**self).full_barrier()
                }

                fn fill(&self, addr: VirtAddr, byte: u8, len: usize) -> Result<(), Self::Error> {
                    (**self).fill(addr, byte, len)
                }

                fn copy(&self, src: VirtAddr, dst: VirtAddr, len: usize) -> Result<(), Self::Error> {
                    (**self).copy(src, dst, len)
                }
            }
        )*
    };
}

forward_mem_ops!(&T, alloc::rc::Rc<T>, alloc::sync::Arc<T>);
