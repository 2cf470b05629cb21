//! Constant buffer readback
//!
//! The game's constant buffers are GPU-only. To inspect one, the reader
//! creates a staging twin of the same size, copies into it and maps the copy
//! read-only. The bound buffer itself is never written.
//!
//! [`ConstantBufferInfo`] is the mapped view. It borrows the device, and
//! dropping it unmaps and releases the staging copy, so no exit path can
//! leak either.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};
use vrshim_gpu::RenderDevice;
use vrshim_sdk::{ShaderStage, CONSTANT_BUFFER_SLOT_COUNT};

use crate::error::{VrError, VrResult};
use crate::memory::MemorySafetyManager;

/// A mapped staging copy of one constant buffer
pub struct ConstantBufferInfo<'d, D: RenderDevice> {
    device: &'d D,
    memory: Arc<MemorySafetyManager>,
    staging: D::Buffer,
    data: *const u8,
    size: usize,
    mapped: bool,
    description: String,
}

impl<'d, D: RenderDevice> ConstantBufferInfo<'d, D> {
    /// The buffer contents, empty once unmapped
    pub fn data(&self) -> &[u8] {
        if !self.mapped || self.data.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.data, self.size) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Copy of the contents that outlives the mapping
    pub fn to_vec(&self) -> Vec<u8> {
        self.data().to_vec()
    }

    /// Unmap now instead of at drop
    pub fn unmap(&mut self) {
        if self.mapped {
            if !self.data.is_null() {
                self.memory.track_deallocation(self.data);
            }
            self.device.unmap(&self.staging);
            self.mapped = false;
        }
    }
}

impl<D: RenderDevice> Drop for ConstantBufferInfo<'_, D> {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl<D: RenderDevice> fmt::Debug for ConstantBufferInfo<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstantBufferInfo")
            .field("description", &self.description)
            .field("size", &self.size)
            .field("mapped", &self.mapped)
            .finish()
    }
}

/// One line of probe output
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRecord {
    pub stage: ShaderStage,
    pub slot: u32,
    pub size: usize,
    /// First row of a matrix at byte 0
    pub row0_at_0: Option<[f32; 4]>,
    /// First row of a matrix at byte 64
    pub row0_at_64: Option<[f32; 4]>,
}

impl fmt::Display for ProbeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[probe] {} slot {} size={}", self.stage, self.slot, self.size)?;
        if let Some(r) = self.row0_at_0 {
            write!(f, " @0=[{:.4}, {:.4}, {:.4}, {:.4}]", r[0], r[1], r[2], r[3])?;
        }
        if let Some(r) = self.row0_at_64 {
            write!(f, " @64=[{:.4}, {:.4}, {:.4}, {:.4}]", r[0], r[1], r[2], r[3])?;
        }
        Ok(())
    }
}

fn first_row(bytes: &[u8], offset: usize) -> Option<[f32; 4]> {
    let chunk = bytes.get(offset..offset + 16)?;
    let mut row = [0.0f32; 4];
    for (i, v) in chunk.chunks_exact(4).enumerate() {
        row[i] = f32::from_le_bytes([v[0], v[1], v[2], v[3]]);
    }
    Some(row)
}

/// Copies bound constant buffers into CPU-visible memory
pub struct ConstantBufferReader {
    memory: Arc<MemorySafetyManager>,
}

impl ConstantBufferReader {
    pub fn new(memory: Arc<MemorySafetyManager>) -> Self {
        Self { memory }
    }

    /// Map a staging copy of the buffer bound at `stage`/`slot`
    pub fn read<'d, D: RenderDevice>(
        &self,
        device: &'d D,
        stage: ShaderStage,
        slot: u32,
    ) -> VrResult<ConstantBufferInfo<'d, D>> {
        if slot >= CONSTANT_BUFFER_SLOT_COUNT {
            return Err(VrError::BufferMapFailed(format!(
                "{stage} slot {slot} out of range (max {})",
                CONSTANT_BUFFER_SLOT_COUNT - 1
            )));
        }

        let bound = device
            .constant_buffer(stage, slot)
            .ok_or_else(|| VrError::BufferMapFailed(format!("nothing bound at {stage} slot {slot}")))?;
        let desc = device.buffer_desc(&bound);
        if desc.byte_width == 0 {
            return Err(VrError::BufferMapFailed(format!("{stage} slot {slot} is empty")));
        }

        let staging = device
            .create_staging_buffer(&desc)
            .map_err(|e| VrError::BufferMapFailed(e.to_string()))?;
        device.copy_buffer(&staging, &bound);
        let mapped = device
            .map_read(&staging)
            .map_err(|e| VrError::BufferMapFailed(e.to_string()))?;

        let mut info = ConstantBufferInfo {
            device,
            memory: Arc::clone(&self.memory),
            staging,
            data: mapped.ptr,
            size: mapped.len.min(desc.byte_width as usize),
            mapped: true,
            description: format!("{stage} cb{slot}"),
        };
        self.memory
            .track_allocation(info.data, info.size, &format!("{} staging", info.description));

        if !self.memory.is_safe_to_read(info.data, info.size) {
            info.unmap();
            return Err(VrError::MemoryValidationFailed(format!(
                "mapped {} at {:x} (+{:#x}) is not readable",
                info.description, info.data as usize, info.size
            )));
        }

        debug!(target: "vrshim::cbuffer", "Mapped {} ({} bytes)", info.description, info.size);
        Ok(info)
    }

    /// Read `slot` from the vertex stage, then the pixel stage, until
    /// `accept` takes the contents
    ///
    /// A vertex buffer that is unbound, too short or rejected by `accept`
    /// all fall through to the pixel stage.
    pub fn read_with_fallback<D: RenderDevice, T>(
        &self,
        device: &D,
        slot: u32,
        mut accept: impl FnMut(&[u8]) -> Option<T>,
    ) -> VrResult<(ShaderStage, T)> {
        let mut last = VrError::BufferMapFailed(format!("slot {slot} not read"));
        for stage in [ShaderStage::Vertex, ShaderStage::Pixel] {
            match self.read(device, stage, slot) {
                Ok(info) => {
                    if let Some(found) = accept(info.data()) {
                        return Ok((stage, found));
                    }
                    debug!(target: "vrshim::cbuffer", "{} has no usable data", info.description());
                    last = VrError::MatrixExtractionFailed(format!(
                        "no valid matrix in {}",
                        info.description()
                    ));
                }
                Err(e) => {
                    debug!(target: "vrshim::cbuffer", "{} slot {} unavailable: {}", stage, slot, e);
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Sweep every vertex and pixel slot and log what is bound
    pub fn probe<D: RenderDevice>(&self, device: &D, frame: u64) -> Vec<ProbeRecord> {
        let mut records = Vec::new();
        for stage in [ShaderStage::Vertex, ShaderStage::Pixel] {
            for slot in 0..CONSTANT_BUFFER_SLOT_COUNT {
                let Ok(info) = self.read(device, stage, slot) else {
                    continue;
                };
                let data = info.data();
                let record = ProbeRecord {
                    stage,
                    slot,
                    size: info.size(),
                    row0_at_0: first_row(data, 0),
                    row0_at_64: first_row(data, 64),
                };
                info!(target: "vrshim::probe", "frame {}: {}", frame, record);
                records.push(record);
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrshim_gpu::{FailPoint, HeadlessDevice};
    use vrshim_sdk::{mat4_from_le_bytes, mat4_to_le_bytes, IDENTITY};

    fn reader() -> ConstantBufferReader {
        ConstantBufferReader::new(Arc::new(MemorySafetyManager::default()))
    }

    #[test]
    fn test_read_maps_copy_and_releases() {
        let device = HeadlessDevice::new(640, 480);
        device.bind_constant_buffer(ShaderStage::Vertex, 0, vec![7u8; 128]);
        let reader = reader();

        {
            let info = reader.read(&device, ShaderStage::Vertex, 0).unwrap();
            assert!(info.is_mapped());
            assert_eq!(info.size(), 128);
            assert!(info.data().iter().all(|&b| b == 7));
            assert_eq!(device.live_staging_buffers(), 1);
            assert_eq!(device.mapped_buffers(), 1);
            assert_eq!(reader.memory.total_allocated(), 128);
        }

        assert_eq!(device.live_staging_buffers(), 0);
        assert_eq!(device.mapped_buffers(), 0);
        assert_eq!(reader.memory.allocation_count(), 0);
        // The bound buffer is untouched
        assert_eq!(
            device.constant_buffer_bytes(ShaderStage::Vertex, 0),
            Some(vec![7u8; 128])
        );
    }

    #[test]
    fn test_map_failure_releases_staging() {
        let device = HeadlessDevice::new(640, 480);
        device.bind_constant_buffer(ShaderStage::Vertex, 0, vec![0u8; 64]);
        device.fail_on(FailPoint::Map);

        let err = reader().read(&device, ShaderStage::Vertex, 0).unwrap_err();
        assert!(matches!(err, VrError::BufferMapFailed(_)));
        assert_eq!(device.live_staging_buffers(), 0);
        assert_eq!(device.mapped_buffers(), 0);
    }

    #[test]
    fn test_unbound_and_out_of_range_slots() {
        let device = HeadlessDevice::new(640, 480);
        let reader = reader();
        assert!(matches!(
            reader.read(&device, ShaderStage::Vertex, 3),
            Err(VrError::BufferMapFailed(_))
        ));
        assert!(matches!(
            reader.read(&device, ShaderStage::Vertex, 14),
            Err(VrError::BufferMapFailed(_))
        ));
    }

    #[test]
    fn test_fallback_to_pixel_stage() {
        let device = HeadlessDevice::new(640, 480);
        device.bind_constant_buffer(ShaderStage::Pixel, 2, vec![1u8; 64]);

        let (stage, size) = reader()
            .read_with_fallback(&device, 2, |bytes| Some(bytes.len()))
            .unwrap();
        assert_eq!(stage, ShaderStage::Pixel);
        assert_eq!(size, 64);
    }

    #[test]
    fn test_rejected_vertex_contents_fall_back() {
        let device = HeadlessDevice::new(640, 480);
        let mut m = IDENTITY;
        m[12] = 5.0;
        device.bind_constant_buffer(ShaderStage::Vertex, 1, vec![0u8; 32]);
        device.bind_constant_buffer(ShaderStage::Pixel, 1, mat4_to_le_bytes(&m).to_vec());
        let reader = reader();

        let has_translation = |bytes: &[u8]| {
            let raw: [u8; 64] = bytes.get(0..64)?.try_into().ok()?;
            let m = mat4_from_le_bytes(&raw);
            (m[12] != 0.0).then_some(m)
        };
        let (stage, found) = reader.read_with_fallback(&device, 1, has_translation).unwrap();
        assert_eq!(stage, ShaderStage::Pixel);
        assert_eq!(found, m);
        assert_eq!(device.live_staging_buffers(), 0);

        let err = reader.read_with_fallback(&device, 1, |_| None::<()>).unwrap_err();
        assert!(matches!(err, VrError::MatrixExtractionFailed(_)));
    }

    #[test]
    fn test_probe_reports_bound_slots() {
        let device = HeadlessDevice::new(640, 480);
        device.bind_constant_buffer(ShaderStage::Vertex, 0, mat4_to_le_bytes(&IDENTITY).to_vec());
        device.bind_constant_buffer(ShaderStage::Pixel, 5, vec![0u8; 16]);

        let records = reader().probe(&device, 1);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].row0_at_0, Some([1.0, 0.0, 0.0, 0.0]));
        assert_eq!(records[0].row0_at_64, None);
        assert_eq!(records[1].stage, ShaderStage::Pixel);
        assert_eq!(records[1].slot, 5);
        assert_eq!(device.live_staging_buffers(), 0);
    }
}
