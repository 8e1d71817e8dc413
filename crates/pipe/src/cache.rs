//! Cache of converted and compiled shader variants.
//!
//! Entries are keyed by the module identity and the complete converter context.
//! The map lock only guards map access. Every key owns a slot with its own
//! lock which is held while that key is converted and compiled, so one key is
//! never compiled twice while unrelated keys compile concurrently.
//!
//! Serialized layout, little-endian:
//!
//! ```text
//! header_size: u32 = 32
//! version:     u32 = 1
//! vendor_id:   u32
//! device_id:   u32
//! cache_uuid:  [u8; 16]
//! record_count: u32
//! records: [
//!     module_hash: u64
//!     module_size: u64
//!     context_len: u32, context: [u8; context_len]    (bincode)
//!     artifact_len: u32, artifact: [u8; artifact_len] (bincode)
//! ]
//! ```

use std::{ptr, sync::Arc};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::{
    compiler::CompileError,
    converter::{
        ConvertError, ConvertedShader, ConverterContext, EntryPointInfo, ShaderModule,
        ShaderModuleKey,
    },
    device::{Device, DeviceInfo},
    native::{NativeFunction, NativeLibrary},
};

pub const HEADER_SIZE: u32 = 32;
pub const HEADER_VERSION: u32 = 1;

const RECORD_COUNT_SIZE: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Converted shader with its native library.
///
/// Libraries read from serialized caches compile their native library on first use.
pub struct ShaderLibrary {
    shader: ConvertedShader,
    native: Mutex<Option<NativeLibrary>>,
}

impl std::fmt::Debug for ShaderLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderLibrary")
            .field("entry_point", &self.shader.entry_point.name)
            .field("compiled", &self.native.lock().is_some())
            .finish()
    }
}

impl ShaderLibrary {
    pub(crate) fn deferred(shader: ConvertedShader) -> Self {
        ShaderLibrary {
            shader,
            native: Mutex::new(None),
        }
    }

    /// Converts `module` and compiles the native library.
    pub(crate) fn compile(
        device: &Device,
        context: &ConverterContext,
        module: &ShaderModule,
    ) -> Result<Self, LibraryError> {
        let shader = device.convert(module, context)?;
        let library = ShaderLibrary::deferred(shader);
        library.native_library(device)?;
        Ok(library)
    }

    pub fn shader(&self) -> &ConvertedShader {
        &self.shader
    }

    pub fn entry_point(&self) -> &EntryPointInfo {
        &self.shader.entry_point
    }

    pub fn is_compiled(&self) -> bool {
        self.native.lock().is_some()
    }

    pub fn native_library(&self, device: &Device) -> Result<NativeLibrary, CompileError> {
        let mut native = self.native.lock();
        if let Some(library) = &*native {
            return Ok(library.clone());
        }

        let library = device.compile_library(&self.shader)?;
        *native = Some(library.clone());
        Ok(library)
    }

    /// Native function of the converted entry point.
    pub fn function(&self, device: &Device) -> Result<NativeFunction, CompileError> {
        Ok(NativeFunction {
            library: self.native_library(device)?,
            name: self.shader.entry_point.name.clone(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    module: ShaderModuleKey,
    context: ConverterContext,
}

#[derive(Default)]
struct CacheSlot {
    library: Mutex<Option<Arc<ShaderLibrary>>>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, Arc<CacheSlot>>,

    /// Bumped whenever an entry is filled.
    generation: u64,

    /// Serialized size and the generation it was measured at.
    data_size: Option<(u64, usize)>,
}

impl CacheState {
    fn invalidate_size(&mut self) {
        self.generation += 1;
        self.data_size = None;
    }
}

/// Outcome of [`PipelineCache::write_data`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteResult {
    /// Whole cache written, or its size when no buffer was given.
    Complete(usize),

    /// Buffer was too small. Holds the number of bytes written.
    Incomplete(usize),
}

#[derive(Debug, thiserror::Error)]
enum CacheReadError {
    #[error("data is too short for a header")]
    TooShort,

    #[error("unexpected header size {0}")]
    HeaderSize(u32),

    #[error("unsupported version {0}")]
    Version(u32),

    #[error("data was written by another device")]
    ForeignDevice,

    #[error("record {0} is truncated")]
    Truncated(u32),

    #[error("record {index} is corrupt: {source}")]
    Corrupt {
        index: u32,
        #[source]
        source: bincode::Error,
    },
}

pub struct PipelineCache {
    info: DeviceInfo,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCache")
            .field("info", &self.info)
            .field("entries", &self.len())
            .finish()
    }
}

impl PipelineCache {
    /// Creates a cache, seeding it from `initial_data` when it was written by a matching device.
    ///
    /// Unrecognized or corrupt data yields an empty cache.
    pub fn new(info: DeviceInfo, initial_data: &[u8]) -> Self {
        let cache = PipelineCache {
            info,
            state: Mutex::new(CacheState::default()),
        };

        if !initial_data.is_empty() {
            match cache.read_data(initial_data) {
                Ok(entries) => {
                    tracing::debug!("Pipeline cache loaded {} entries", entries.len());
                    let mut state = cache.state.lock();
                    for (key, library) in entries {
                        state.entries.entry(key).or_insert_with(|| {
                            Arc::new(CacheSlot {
                                library: Mutex::new(Some(library)),
                            })
                        });
                    }
                }
                Err(err) => {
                    tracing::warn!("Ignoring pipeline cache data: {}", err);
                }
            }
        }

        cache
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Number of cached shader variants.
    pub fn len(&self) -> usize {
        self.filled_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the library for `module` converted with `context`, converting and compiling it on miss.
    pub fn get_shader_library(
        &self,
        device: &Device,
        context: &ConverterContext,
        module: &ShaderModule,
    ) -> Result<Arc<ShaderLibrary>, LibraryError> {
        let key = CacheKey {
            module: module.key(),
            context: context.clone(),
        };

        let slot = self.state.lock().entries.entry(key.clone()).or_default().clone();

        let mut library = slot.library.lock();
        if let Some(library) = &*library {
            tracing::debug!(
                "Pipeline cache hit for {} entry point {:?}",
                context.stage,
                context.entry_point
            );
            device.stats().record_cache_hit();
            return Ok(library.clone());
        }

        tracing::debug!(
            "Pipeline cache miss for {} entry point {:?}",
            context.stage,
            context.entry_point
        );
        device.stats().record_cache_miss();

        let compiled = match ShaderLibrary::compile(device, context, module) {
            Ok(compiled) => Arc::new(compiled),
            Err(err) => {
                // Waiters on this slot retry on their own.
                let mut state = self.state.lock();
                if state
                    .entries
                    .get(&key)
                    .is_some_and(|existing| Arc::ptr_eq(existing, &slot))
                {
                    state.entries.remove(&key);
                }
                return Err(err);
            }
        };
        *library = Some(compiled.clone());

        let mut state = self.state.lock();
        // A failed compile may have unlinked this slot while we waited on it.
        state.entries.entry(key).or_insert_with(|| slot.clone());
        state.invalidate_size();
        drop(state);
        drop(library);

        Ok(compiled)
    }

    /// Merges entries of `sources` into this cache.
    ///
    /// Entries already present are kept. Merging a cache into itself does nothing.
    pub fn merge_pipeline_caches(&self, sources: &[&PipelineCache]) {
        for &source in sources {
            if ptr::eq(source, self) {
                continue;
            }

            let mut merged = 0;
            for (key, library) in source.filled_entries() {
                let slot = self.state.lock().entries.entry(key).or_default().clone();
                let mut existing = slot.library.lock();
                if existing.is_none() {
                    *existing = Some(library);
                    merged += 1;
                }
            }

            if merged > 0 {
                tracing::debug!("Merged {} pipeline cache entries", merged);
                self.state.lock().invalidate_size();
            }
        }
    }

    /// Serializes the cache into `buffer`, or returns the required size when `buffer` is `None`.
    ///
    /// A buffer that is too small receives the header and as many whole records as fit.
    pub fn write_data(&self, buffer: Option<&mut [u8]>) -> WriteResult {
        let Some(buffer) = buffer else {
            let generation = match self.size_snapshot() {
                Ok(size) => return WriteResult::Complete(size),
                Err(generation) => generation,
            };
            let size = Self::data_size(&self.records());
            self.store_size(generation, size);
            return WriteResult::Complete(size);
        };

        let records = self.records();
        let prefix = HEADER_SIZE as usize + RECORD_COUNT_SIZE;
        if buffer.len() < prefix {
            return WriteResult::Incomplete(0);
        }

        let mut count = 0;
        let mut size = prefix;
        for record in &records {
            if size + record.len() > buffer.len() {
                break;
            }
            size += record.len();
            count += 1;
        }

        let mut out = Vec::with_capacity(size);
        self.write_header(&mut out);
        out.extend_from_slice(&(count as u32).to_le_bytes());
        for record in &records[..count] {
            out.extend_from_slice(record);
        }
        buffer[..size].copy_from_slice(&out);

        if count == records.len() {
            WriteResult::Complete(size)
        } else {
            tracing::debug!(
                "Pipeline cache buffer fits {} of {} records",
                count,
                records.len()
            );
            WriteResult::Incomplete(size)
        }
    }

    fn filled_entries(&self) -> Vec<(CacheKey, Arc<ShaderLibrary>)> {
        let slots: Vec<_> = self
            .state
            .lock()
            .entries
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();

        slots
            .into_iter()
            .filter_map(|(key, slot)| {
                let library = slot.library.lock().clone()?;
                Some((key, library))
            })
            .collect()
    }

    /// Encoded records sorted by their bytes so that output does not depend on map order.
    fn records(&self) -> Vec<Vec<u8>> {
        let mut records: Vec<_> = self
            .filled_entries()
            .into_iter()
            .filter_map(|(key, library)| match encode_record(&key, library.shader()) {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::warn!("Failed to serialize pipeline cache entry: {}", err);
                    None
                }
            })
            .collect();
        records.sort_unstable();
        records
    }

    /// Memoized serialized size, or the current generation when none is valid.
    fn size_snapshot(&self) -> Result<usize, u64> {
        let state = self.state.lock();
        match state.data_size {
            Some((generation, size)) if generation == state.generation => Ok(size),
            _ => Err(state.generation),
        }
    }

    /// Memoizes `size` unless an entry was filled after `generation` was observed.
    fn store_size(&self, generation: u64, size: usize) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.data_size = Some((generation, size));
        }
    }

    fn data_size(records: &[Vec<u8>]) -> usize {
        HEADER_SIZE as usize + RECORD_COUNT_SIZE + records.iter().map(Vec::len).sum::<usize>()
    }

    fn write_header(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&HEADER_SIZE.to_le_bytes());
        out.extend_from_slice(&HEADER_VERSION.to_le_bytes());
        out.extend_from_slice(&self.info.vendor_id.to_le_bytes());
        out.extend_from_slice(&self.info.device_id.to_le_bytes());
        out.extend_from_slice(&self.info.cache_uuid);
    }

    fn read_data(
        &self,
        data: &[u8],
    ) -> Result<Vec<(CacheKey, Arc<ShaderLibrary>)>, CacheReadError> {
        let mut reader = Reader { data };

        let header_size = reader.u32().ok_or(CacheReadError::TooShort)?;
        if header_size != HEADER_SIZE {
            return Err(CacheReadError::HeaderSize(header_size));
        }
        let version = reader.u32().ok_or(CacheReadError::TooShort)?;
        if version != HEADER_VERSION {
            return Err(CacheReadError::Version(version));
        }
        let vendor_id = reader.u32().ok_or(CacheReadError::TooShort)?;
        let device_id = reader.u32().ok_or(CacheReadError::TooShort)?;
        let uuid = reader.bytes(16).ok_or(CacheReadError::TooShort)?;
        if vendor_id != self.info.vendor_id
            || device_id != self.info.device_id
            || uuid != self.info.cache_uuid
        {
            return Err(CacheReadError::ForeignDevice);
        }

        let count = reader.u32().ok_or(CacheReadError::TooShort)?;
        let mut entries = Vec::new();

        for index in 0..count {
            let (key, shader) =
                decode_record(&mut reader, index)?.ok_or(CacheReadError::Truncated(index))?;
            entries.push((key, Arc::new(ShaderLibrary::deferred(shader))));
        }

        Ok(entries)
    }
}

fn encode_record(key: &CacheKey, shader: &ConvertedShader) -> Result<Vec<u8>, bincode::Error> {
    let context = bincode::serialize(&key.context)?;
    let artifact = bincode::serialize(shader)?;

    let mut record = Vec::with_capacity(24 + context.len() + artifact.len());
    record.extend_from_slice(&key.module.hash.to_le_bytes());
    record.extend_from_slice(&key.module.size.to_le_bytes());
    record.extend_from_slice(&(context.len() as u32).to_le_bytes());
    record.extend_from_slice(&context);
    record.extend_from_slice(&(artifact.len() as u32).to_le_bytes());
    record.extend_from_slice(&artifact);
    Ok(record)
}

/// Returns `Ok(None)` when data ends inside the record.
fn decode_record(
    reader: &mut Reader<'_>,
    index: u32,
) -> Result<Option<(CacheKey, ConvertedShader)>, CacheReadError> {
    let corrupt = |source| CacheReadError::Corrupt { index, source };

    let Some(hash) = reader.u64() else {
        return Ok(None);
    };
    let Some(size) = reader.u64() else {
        return Ok(None);
    };
    let Some(context) = reader.u32().and_then(|len| reader.bytes(len as usize)) else {
        return Ok(None);
    };
    let Some(artifact) = reader.u32().and_then(|len| reader.bytes(len as usize)) else {
        return Ok(None);
    };

    let context = bincode::deserialize(context).map_err(corrupt)?;
    let shader = bincode::deserialize(artifact).map_err(corrupt)?;

    Ok(Some((
        CacheKey {
            module: ShaderModuleKey { hash, size },
            context,
        },
        shader,
    )))
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.data.len() < len {
            return None;
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Some(head)
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes = self.bytes(4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        let bytes = self.bytes(8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }
}
