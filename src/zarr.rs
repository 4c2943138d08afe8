use std::path::Path;
use std::sync::Arc;

use zarrs::array::codec::bytes_to_bytes::blosc::{BloscCodec, BloscCompressor, BloscShuffleMode};
use zarrs::array::codec::api::BytesToBytesCodecTraits;
use zarrs::array::{data_type, Array, ArrayBuilder};
use zarrs::config::MetadataRetrieveVersion;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::GroupBuilder;
use zarrs::storage::ReadableWritableListableStorageTraits;

use crate::error::{Error, Result};

pub type Store = Arc<FilesystemStore>;

/// Type alias for arrays in the store.
pub type StoreArray = Array<dyn ReadableWritableListableStorageTraits>;

/// Bytes-to-bytes codec selection for newly created arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
}

impl Compression {
    pub fn from_name(name: &str) -> Result<Compression> {
        match name {
            "none" => Ok(Compression::None),
            "zstd" => Ok(Compression::Zstd),
            other => Err(Error::config(
                "extract",
                format!("unknown compression {:?}", other),
            )),
        }
    }

    fn codecs(self) -> Result<Vec<Arc<dyn BytesToBytesCodecTraits>>> {
        match self {
            Compression::None => Ok(vec![]),
            Compression::Zstd => {
                let clevel = 5u8
                    .try_into()
                    .map_err(|_| Error::Storage("invalid blosc level".into()))?;
                let codec = BloscCodec::new(
                    BloscCompressor::Zstd,
                    clevel,
                    None,
                    BloscShuffleMode::Shuffle,
                    None,
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(vec![Arc::new(codec)])
            }
        }
    }
}

pub fn open_store(root: &Path) -> Result<Store> {
    let store = FilesystemStore::new(root)?;
    Ok(Arc::new(store))
}

/// Open a Zarr v3 array. Rejects v2 data.
pub fn open_array(store: &Store, path: &str) -> Result<StoreArray> {
    let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
    let array = Array::open_opt(store_trait, path, &MetadataRetrieveVersion::V3)?;
    Ok(array)
}

/// Ensure v3 group metadata exists for the root and each named child group.
pub fn ensure_groups(store: &Store, paths: &[&str]) -> Result<()> {
    let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
    let root = GroupBuilder::new().build(store_trait.clone(), "/")?;
    root.store_metadata()?;
    for path in paths {
        let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
        let group = GroupBuilder::new().build(store_trait, path)?;
        group.store_metadata()?;
    }
    Ok(())
}

macro_rules! create_array_fn {
    ($name:ident, $dtype:expr, $fill:expr) => {
        pub fn $name(
            store: &Store,
            path: &str,
            shape: Vec<u64>,
            chunks: Vec<u64>,
            compression: Compression,
            attrs: Option<serde_json::Map<String, serde_json::Value>>,
        ) -> Result<StoreArray> {
            let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
            let mut builder = ArrayBuilder::new(shape.clone(), chunks.clone(), $dtype, $fill);
            builder.bytes_to_bytes_codecs(compression.codecs()?);
            if let Some(a) = attrs {
                builder.attributes(a);
            }
            let array = builder.build(store_trait, path)?;
            array.store_metadata()?;
            Ok(array)
        }
    };
}

create_array_fn!(create_array_f32, data_type::float32(), 0.0f32);
create_array_fn!(create_array_u32, data_type::uint32(), 0u32);
create_array_fn!(create_array_u64, data_type::uint64(), 0u64);

pub fn read_chunk_f32(
    array: &Array<impl zarrs::storage::ReadableStorageTraits + ?Sized + 'static>,
    chunk_indices: &[u64],
) -> Result<Vec<f32>> {
    let data = array.retrieve_chunk::<Vec<f32>>(chunk_indices)?;
    Ok(data)
}

pub fn read_chunk_u32(
    array: &Array<impl zarrs::storage::ReadableStorageTraits + ?Sized + 'static>,
    chunk_indices: &[u64],
) -> Result<Vec<u32>> {
    let data = array.retrieve_chunk::<Vec<u32>>(chunk_indices)?;
    Ok(data)
}

pub fn read_chunk_u64(
    array: &Array<impl zarrs::storage::ReadableStorageTraits + ?Sized + 'static>,
    chunk_indices: &[u64],
) -> Result<Vec<u64>> {
    let data = array.retrieve_chunk::<Vec<u64>>(chunk_indices)?;
    Ok(data)
}

pub fn store_chunk_f32(
    array: &Array<impl zarrs::storage::WritableStorageTraits + ?Sized + 'static>,
    chunk_indices: &[u64],
    data: &[f32],
) -> Result<()> {
    array.store_chunk(chunk_indices, data)?;
    Ok(())
}

pub fn store_chunk_u32(
    array: &Array<impl zarrs::storage::WritableStorageTraits + ?Sized + 'static>,
    chunk_indices: &[u64],
    data: &[u32],
) -> Result<()> {
    array.store_chunk(chunk_indices, data)?;
    Ok(())
}

pub fn store_chunk_u64(
    array: &Array<impl zarrs::storage::WritableStorageTraits + ?Sized + 'static>,
    chunk_indices: &[u64],
    data: &[u64],
) -> Result<()> {
    array.store_chunk(chunk_indices, data)?;
    Ok(())
}
