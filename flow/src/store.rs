//! Chunked persistent storage.
//!
//! A dataset lives under a `/`-joined logical path whose parent groups are
//! created on demand; an existing dataset at the leaf is replaced. The
//! filesystem backend keeps one directory per group, a `meta.json` per
//! dataset, and one raw little-endian f32 file per written block.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use common::nd_buffer::NdBuffer;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::desc::{ArrayDescriptor, DType};
use crate::error::{EngineError, Result};
use crate::roi::Roi;

/// Compression setting recorded in the dataset layout metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

/// Layout metadata persisted with every dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub chunk_shape: Vec<usize>,
    pub compression: Compression,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

pub trait Dataset: Send + Sync {
    fn write_block(&self, roi: &Roi, data: &NdBuffer<f32>) -> Result<()>;
    fn set_attr(&self, name: &str, value: serde_json::Value) -> Result<()>;
}

pub trait ChunkStore: Send + Sync {
    fn create_dataset(
        &self,
        path: &str,
        descriptor: &ArrayDescriptor,
        chunk_shape: &[usize],
        compression: Compression,
    ) -> Result<Arc<dyn Dataset>>;
}

/// Splits a `/`-joined logical path into its group segments and leaf name.
fn split_path(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.pop() {
        Some(leaf) => Ok((segments, leaf)),
        None => Err(EngineError::store(format!("empty dataset path {path:?}"))),
    }
}

fn check_block(shape: &[usize], roi: &Roi, data: &NdBuffer<f32>) -> Result<()> {
    if !roi.fits(shape) {
        return Err(EngineError::store(format!(
            "block {:?}..{:?} exceeds dataset shape {:?}",
            roi.start, roi.stop, shape
        )));
    }
    if data.shape() != roi.shape().as_slice() {
        return Err(EngineError::store("block data shape does not match region"));
    }
    Ok(())
}

/// Directory-tree backend: one directory per group, one file per block.
pub struct FsChunkStore {
    root: PathBuf,
}

impl FsChunkStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

impl ChunkStore for FsChunkStore {
    fn create_dataset(
        &self,
        path: &str,
        descriptor: &ArrayDescriptor,
        chunk_shape: &[usize],
        compression: Compression,
    ) -> Result<Arc<dyn Dataset>> {
        let (groups, leaf) = split_path(path)?;
        let mut dir = self.root.clone();
        for group in groups {
            dir.push(group);
        }
        fs::create_dir_all(&dir)?;
        dir.push(leaf);
        if dir.exists() {
            debug!(?dir, "replacing existing dataset");
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir(&dir)?;

        let meta = DatasetMeta {
            shape: descriptor.shape.clone(),
            dtype: descriptor.dtype,
            chunk_shape: chunk_shape.to_vec(),
            compression,
            attributes: serde_json::Map::new(),
        };
        let dataset = FsDataset {
            dir,
            meta: Mutex::new(meta),
        };
        dataset.persist_meta()?;
        Ok(Arc::new(dataset))
    }
}

pub struct FsDataset {
    dir: PathBuf,
    meta: Mutex<DatasetMeta>,
}

impl FsDataset {
    fn persist_meta(&self) -> Result<()> {
        let meta = self.meta.lock();
        let json = serde_json::to_string_pretty(&*meta)?;
        fs::write(self.dir.join("meta.json"), json)?;
        Ok(())
    }

    fn block_file(&self, start: &[usize]) -> PathBuf {
        let name: Vec<String> = start.iter().map(|s| s.to_string()).collect();
        self.dir.join(format!("block_{}.raw", name.join("_")))
    }

    /// Reads a previously written block back, for verification.
    pub fn read_block(&self, roi: &Roi) -> Result<NdBuffer<f32>> {
        let bytes = fs::read(self.block_file(&roi.start))?;
        if bytes.len() != roi.num_elements() * std::mem::size_of::<f32>() {
            return Err(EngineError::store("corrupt block file"));
        }
        let values: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
        Ok(NdBuffer::new(roi.shape(), values))
    }
}

impl Dataset for FsDataset {
    fn write_block(&self, roi: &Roi, data: &NdBuffer<f32>) -> Result<()> {
        check_block(&self.meta.lock().shape, roi, data)?;
        let bytes: &[u8] = bytemuck::cast_slice(data.as_slice());
        fs::write(self.block_file(&roi.start), bytes)?;
        Ok(())
    }

    fn set_attr(&self, name: &str, value: serde_json::Value) -> Result<()> {
        self.meta.lock().attributes.insert(name.to_string(), value);
        self.persist_meta()
    }
}

/// In-memory backend recording every block and attribute, for tests.
#[derive(Default)]
pub struct MemChunkStore {
    datasets: Mutex<HashMap<String, Arc<MemDataset>>>,
}

impl MemChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dataset(&self, path: &str) -> Option<Arc<MemDataset>> {
        self.datasets.lock().get(path).cloned()
    }
}

impl ChunkStore for MemChunkStore {
    fn create_dataset(
        &self,
        path: &str,
        descriptor: &ArrayDescriptor,
        chunk_shape: &[usize],
        compression: Compression,
    ) -> Result<Arc<dyn Dataset>> {
        split_path(path)?;
        let dataset = Arc::new(MemDataset {
            meta: Mutex::new(DatasetMeta {
                shape: descriptor.shape.clone(),
                dtype: descriptor.dtype,
                chunk_shape: chunk_shape.to_vec(),
                compression,
                attributes: serde_json::Map::new(),
            }),
            blocks: Mutex::new(Vec::new()),
        });
        self.datasets
            .lock()
            .insert(path.to_string(), dataset.clone());
        Ok(dataset)
    }
}

pub struct MemDataset {
    pub meta: Mutex<DatasetMeta>,
    pub blocks: Mutex<Vec<(Roi, NdBuffer<f32>)>>,
}

impl MemDataset {
    /// Reassembles every written block into one array, for verification.
    pub fn assemble(&self) -> NdBuffer<f32> {
        let shape = self.meta.lock().shape.clone();
        let mut out = NdBuffer::new_default(shape.clone());
        for (roi, data) in self.blocks.lock().iter() {
            out.copy_window_from(data, &vec![0; shape.len()], &roi.start, &roi.shape());
        }
        out
    }
}

impl Dataset for MemDataset {
    fn write_block(&self, roi: &Roi, data: &NdBuffer<f32>) -> Result<()> {
        check_block(&self.meta.lock().shape, roi, data)?;
        self.blocks.lock().push((roi.clone(), data.clone()));
        Ok(())
    }

    fn set_attr(&self, name: &str, value: serde_json::Value) -> Result<()> {
        self.meta.lock().attributes.insert(name.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axes::Axes;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("flow-store-{}", uuid::Uuid::new_v4()))
    }

    fn test_descriptor() -> ArrayDescriptor {
        ArrayDescriptor::new(vec![4, 4, 2], Axes::yxc(), DType::F32)
    }

    #[test]
    fn test_split_path() {
        let (groups, leaf) = split_path("volume/features/stack").unwrap();
        assert_eq!(groups, vec!["volume", "features"]);
        assert_eq!(leaf, "stack");

        let (groups, leaf) = split_path("stack").unwrap();
        assert!(groups.is_empty());
        assert_eq!(leaf, "stack");

        assert!(split_path("").is_err());
    }

    #[test]
    fn test_fs_store_roundtrip() -> anyhow::Result<()> {
        let root = temp_root();
        let store = FsChunkStore::open(&root)?;
        let dataset = store.create_dataset(
            "group/sub/data",
            &test_descriptor(),
            &[2, 2, 2],
            Compression::Gzip,
        )?;

        let roi = Roi::new(vec![0, 0, 0], vec![2, 2, 2]);
        let block = NdBuffer::new(vec![2, 2, 2], (0..8).map(|v| v as f32).collect());
        dataset.write_block(&roi, &block)?;
        dataset.set_attr("drange", serde_json::json!([0.0, 255.0]))?;

        let meta_path = root.join("group").join("sub").join("data").join("meta.json");
        let meta: DatasetMeta = serde_json::from_str(&fs::read_to_string(meta_path)?)?;
        assert_eq!(meta.shape, vec![4, 4, 2]);
        assert_eq!(meta.chunk_shape, vec![2, 2, 2]);
        assert_eq!(meta.compression, Compression::Gzip);
        assert!(meta.attributes.contains_key("drange"));

        fs::remove_dir_all(&root)?;
        Ok(())
    }

    #[test]
    fn test_fs_block_read_back() {
        let root = temp_root();
        let store = FsChunkStore::open(&root).unwrap();
        let dataset = store
            .create_dataset("data", &test_descriptor(), &[2, 2, 2], Compression::None)
            .unwrap();

        let roi = Roi::new(vec![2, 0, 0], vec![4, 2, 2]);
        let block = NdBuffer::new(vec![2, 2, 2], (10..18).map(|v| v as f32).collect());
        dataset.write_block(&roi, &block).unwrap();

        // Trait objects hide the concrete type; reopen through a fresh handle.
        let reader = FsDataset {
            dir: root.join("data"),
            meta: Mutex::new(DatasetMeta {
                shape: vec![4, 4, 2],
                dtype: DType::F32,
                chunk_shape: vec![2, 2, 2],
                compression: Compression::None,
                attributes: serde_json::Map::new(),
            }),
        };
        let back = reader.read_block(&roi).unwrap();
        assert_eq!(back.as_slice(), block.as_slice());

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_fs_replaces_existing_leaf() {
        let root = temp_root();
        let store = FsChunkStore::open(&root).unwrap();
        let dataset = store
            .create_dataset("data", &test_descriptor(), &[2, 2, 2], Compression::None)
            .unwrap();
        let roi = Roi::new(vec![0, 0, 0], vec![2, 2, 2]);
        dataset
            .write_block(&roi, &NdBuffer::new_filled(vec![2, 2, 2], 1.0))
            .unwrap();

        // Creating again at the same leaf drops the old contents.
        store
            .create_dataset("data", &test_descriptor(), &[2, 2, 2], Compression::None)
            .unwrap();
        assert!(!root.join("data").join("block_0_0_0.raw").exists());
        assert!(root.join("data").join("meta.json").exists());

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_block_validation() {
        let store = MemChunkStore::new();
        let dataset = store
            .create_dataset("data", &test_descriptor(), &[2, 2, 2], Compression::None)
            .unwrap();
        let out_of_bounds = Roi::new(vec![3, 3, 0], vec![5, 5, 2]);
        assert!(dataset
            .write_block(&out_of_bounds, &NdBuffer::new_filled(vec![2, 2, 2], 0.0))
            .is_err());
        let roi = Roi::new(vec![0, 0, 0], vec![2, 2, 2]);
        assert!(dataset
            .write_block(&roi, &NdBuffer::new_filled(vec![1, 1, 1], 0.0))
            .is_err());
    }

    #[test]
    fn test_mem_store_assemble() {
        let store = MemChunkStore::new();
        store
            .create_dataset("data", &test_descriptor(), &[2, 2, 2], Compression::None)
            .unwrap();
        let dataset = store.dataset("data").unwrap();
        dataset
            .write_block(
                &Roi::new(vec![0, 0, 0], vec![4, 2, 2]),
                &NdBuffer::new_filled(vec![4, 2, 2], 1.0),
            )
            .unwrap();
        dataset
            .write_block(
                &Roi::new(vec![0, 2, 0], vec![4, 4, 2]),
                &NdBuffer::new_filled(vec![4, 2, 2], 2.0),
            )
            .unwrap();
        let assembled = dataset.assemble();
        assert_eq!(assembled[&[0, 0, 0][..]], 1.0);
        assert_eq!(assembled[&[0, 3, 1][..]], 2.0);
    }
}
