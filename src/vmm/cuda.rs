//! CUDA virtual memory management back end.
//!
//! Maps the allocator seam onto the driver VMM API: one
//! `cuMemAddressReserve` per cache space at engine start, then
//! `cuMemCreate`/`cuMemMap`/`cuMemSetAccess` per physical page as sequences
//! grow and `cuMemUnmap`/`cuMemRelease` when slots are released. Page
//! granularity is the smallest granularity the device supports at or above
//! the requested block size.

use cudarc::driver::sys;

use super::{PageAllocator, Reservation};
use crate::error::{CacheError, Result};

fn check(result: sys::CUresult, what: &str, oom_as: fn(String) -> CacheError) -> Result<()> {
    if result == sys::CUresult::CUDA_SUCCESS {
        return Ok(());
    }
    let message = format!("{what} failed with {result:?}");
    match result {
        sys::CUresult::CUDA_ERROR_OUT_OF_MEMORY => Err(oom_as(message)),
        _ => Err(CacheError::MapFailed(message)),
    }
}

fn allocation_prop(device_id: i32) -> sys::CUmemAllocationProp {
    let mut prop: sys::CUmemAllocationProp = unsafe { std::mem::zeroed() };
    prop.type_ = sys::CUmemAllocationType::CU_MEM_ALLOCATION_TYPE_PINNED;
    prop.requestedHandleTypes = sys::CUmemAllocationHandleType::CU_MEM_HANDLE_TYPE_NONE;
    prop.location.type_ = sys::CUmemLocationType::CU_MEM_LOCATION_TYPE_DEVICE;
    prop.location.id = device_id;
    prop
}

/// One reserved device address range plus the physical handles mapped into
/// it. Dropping the reservation unmaps and releases everything.
pub struct DeviceReservation {
    dptr: sys::CUdeviceptr,
    size: usize,
    page_bytes: usize,
    handles: Vec<Option<sys::CUmemGenericAllocationHandle>>,
}

impl DeviceReservation {
    pub fn device_ptr(&self) -> u64 {
        self.dptr
    }
}

impl Drop for DeviceReservation {
    fn drop(&mut self) {
        for (page, handle) in self.handles.iter().enumerate() {
            if let Some(handle) = handle {
                let addr = self.dptr + (page * self.page_bytes) as u64;
                unsafe {
                    sys::cuMemUnmap(addr, self.page_bytes);
                    sys::cuMemRelease(*handle);
                }
            }
        }
        unsafe {
            sys::cuMemAddressFree(self.dptr, self.size);
        }
    }
}

/// Driver-backed page allocator for a single CUDA device.
pub struct CudaPageAllocator {
    device_id: i32,
    page_bytes: usize,
}

impl CudaPageAllocator {
    /// Queries the device's minimum mapping granularity and rounds the
    /// requested block size up to it. The caller's CUDA context must already
    /// be current (candle initializes it when the device is created).
    pub fn new(device_id: i32, requested_block_bytes: usize) -> Result<Self> {
        let prop = allocation_prop(device_id);
        let mut granularity: usize = 0;
        check(
            unsafe {
                sys::cuMemGetAllocationGranularity(
                    &mut granularity as *mut usize,
                    &prop,
                    sys::CUmemAllocationGranularity_flags::CU_MEM_ALLOC_GRANULARITY_MINIMUM,
                )
            },
            "cuMemGetAllocationGranularity",
            CacheError::ResourceExhausted,
        )?;
        if granularity == 0 {
            return Err(CacheError::ResourceExhausted(
                "driver reported zero mapping granularity".to_string(),
            ));
        }
        let page_bytes = requested_block_bytes.div_ceil(granularity) * granularity;
        if page_bytes != requested_block_bytes {
            tracing::info!(
                requested = requested_block_bytes,
                page_bytes,
                "rounded page size up to device granularity"
            );
        }
        Ok(Self {
            device_id,
            page_bytes,
        })
    }
}

impl PageAllocator for CudaPageAllocator {
    fn page_bytes(&self) -> usize {
        self.page_bytes
    }

    fn reserve(&self, total_pages: usize) -> Result<Reservation> {
        if total_pages == 0 {
            return Err(CacheError::ConfigInvalid(
                "cannot reserve an empty range".to_string(),
            ));
        }
        let size = total_pages * self.page_bytes;
        let mut dptr: sys::CUdeviceptr = 0;
        check(
            unsafe { sys::cuMemAddressReserve(&mut dptr, size, 0, 0, 0) },
            "cuMemAddressReserve",
            CacheError::ResourceExhausted,
        )?;
        let inner = DeviceReservation {
            dptr,
            size,
            page_bytes: self.page_bytes,
            handles: vec![None; total_pages],
        };
        Ok(Reservation::new_device(self.page_bytes, total_pages, inner))
    }

    fn map(&self, reservation: &mut Reservation, page_index: usize, count: usize) -> Result<()> {
        reservation.check_transition(page_index, count, true)?;
        let prop = allocation_prop(self.device_id);
        let mut access: sys::CUmemAccessDesc = unsafe { std::mem::zeroed() };
        access.location = prop.location;
        access.flags = sys::CUmemAccess_flags::CU_MEM_ACCESS_FLAGS_PROT_READWRITE;

        let inner = reservation.device_inner_mut()?;
        for page in page_index..page_index + count {
            let addr = inner.dptr + (page * self.page_bytes) as u64;
            let mut handle: sys::CUmemGenericAllocationHandle = 0;
            check(
                unsafe { sys::cuMemCreate(&mut handle, self.page_bytes, &prop, 0) },
                "cuMemCreate",
                CacheError::OutOfDeviceMemory,
            )
            .inspect_err(|_| {
                // Roll back the pages mapped so far in this call so the
                // caller sees an unchanged reservation.
                for mapped in page_index..page {
                    let addr = inner.dptr + (mapped * self.page_bytes) as u64;
                    if let Some(handle) = inner.handles[mapped].take() {
                        unsafe {
                            sys::cuMemUnmap(addr, self.page_bytes);
                            sys::cuMemRelease(handle);
                        }
                    }
                }
            })?;
            let map_result = check(
                unsafe { sys::cuMemMap(addr, self.page_bytes, 0, handle, 0) },
                "cuMemMap",
                CacheError::MapFailed,
            )
            .and_then(|_| {
                check(
                    unsafe { sys::cuMemSetAccess(addr, self.page_bytes, &access, 1) },
                    "cuMemSetAccess",
                    CacheError::MapFailed,
                )
            });
            if let Err(err) = map_result {
                unsafe {
                    sys::cuMemUnmap(addr, self.page_bytes);
                    sys::cuMemRelease(handle);
                }
                for mapped in page_index..page {
                    let addr = inner.dptr + (mapped * self.page_bytes) as u64;
                    if let Some(handle) = inner.handles[mapped].take() {
                        unsafe {
                            sys::cuMemUnmap(addr, self.page_bytes);
                            sys::cuMemRelease(handle);
                        }
                    }
                }
                return Err(err);
            }
            inner.handles[page] = Some(handle);
        }
        reservation.mark(page_index, count, true);
        Ok(())
    }

    fn unmap(&self, reservation: &mut Reservation, page_index: usize, count: usize) -> Result<()> {
        reservation.check_transition(page_index, count, false)?;
        let inner = reservation.device_inner_mut()?;
        for page in page_index..page_index + count {
            let addr = inner.dptr + (page * self.page_bytes) as u64;
            if let Some(handle) = inner.handles[page].take() {
                check(
                    unsafe { sys::cuMemUnmap(addr, self.page_bytes) },
                    "cuMemUnmap",
                    CacheError::MapFailed,
                )?;
                check(
                    unsafe { sys::cuMemRelease(handle) },
                    "cuMemRelease",
                    CacheError::MapFailed,
                )?;
            }
        }
        reservation.mark(page_index, count, false);
        Ok(())
    }
}

impl Reservation {
    fn device_inner_mut(&mut self) -> Result<&mut DeviceReservation> {
        match &mut self.storage {
            super::ReservationStorage::Device(inner) => Ok(inner),
            _ => Err(CacheError::PreconditionViolated(
                "expected a device reservation".to_string(),
            )),
        }
    }
}
