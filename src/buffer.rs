// GPU buffers
//
// All buffer memory goes through gpu-allocator. Host-visible buffers keep
// the allocator's persistent mapping; device-local buffers are filled via
// staging copies (see RenderContext::create_static_buffer).

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::device::RenderDevice;

pub struct Buffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

impl Buffer {
    pub fn new(
        device: &RenderDevice,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .context("Failed to bind buffer memory")?;
        }

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            size,
            usage,
        })
    }

    /// Persistent mapping, present for host-visible locations only
    pub fn mapped_ptr(&self) -> Option<NonNull<c_void>> {
        self.allocation.as_ref().and_then(|a| a.mapped_ptr())
    }

    /// Copy raw bytes into the mapped allocation
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        anyhow::ensure!(
            data.len() as vk::DeviceSize <= self.size,
            "Write of {} bytes exceeds buffer size {}",
            data.len(),
            self.size
        );
        let ptr = self
            .mapped_ptr()
            .context("Buffer is not host visible, cannot write directly")?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr() as *mut u8, data.len());
        }
        Ok(())
    }

    /// Copy a slice of plain values into the mapped allocation
    pub fn write_data<T: Copy>(&mut self, data: &[T]) -> Result<()> {
        let bytes = unsafe {
            std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data))
        };
        self.write_bytes(bytes)
    }

    /// Read the buffer contents back out of the mapped allocation
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let ptr = self
            .mapped_ptr()
            .context("Buffer is not host visible, cannot read directly")?;
        let mut out = vec![0u8; self.size as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr() as *const u8, out.as_mut_ptr(), out.len());
        }
        Ok(out)
    }

    pub fn destroy(&mut self, device: &RenderDevice) {
        if let Some(allocation) = self.allocation.take() {
            device.free(allocation);
        }
        if self.buffer != vk::Buffer::null() {
            unsafe { device.device.destroy_buffer(self.buffer, None) };
            self.buffer = vk::Buffer::null();
        }
    }
}
