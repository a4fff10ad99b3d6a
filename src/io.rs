//! Persistence of hash maps to a JSON container.
//!
//! A container records the layout of a map and its active entries as dense arrays,
//! one row per entry. Record bytes are stored base64-encoded. Slot indices and the
//! internal layout are not preserved, loading re-inserts every entry.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::raw::utils::debug;
use crate::raw::HashBackend;
use crate::tensor::{Dtype, Tensor};
use crate::{Device, Error, HashMap, Result};

// The version of the container format.
const VERSION: u32 = 1;

// The serialized form of a map.
#[derive(Serialize, Deserialize)]
pub(crate) struct Container {
    version: u32,
    capacity: usize,
    // The device the map was saved from, informational only.
    device: Device,
    backend: HashBackend,
    key: Layout,
    values: Vec<Layout>,
    active_count: usize,
    keys: String,
    values_data: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct Layout {
    dtype: Dtype,
    shape: Vec<usize>,
}

pub(crate) fn save(map: &HashMap, path: &Path) -> Result<()> {
    let container = Container::from_map(map);
    write_json(path, &container)?;

    debug!("saved {} entries to {}", container.active_count, path.display());
    Ok(())
}

pub(crate) fn load(path: &Path, device: Device) -> Result<HashMap> {
    let map = read_json::<Container>(path)?.into_map(device)?;

    debug!("loaded {} entries from {}", map.len(), path.display());
    Ok(map)
}

// Serialize a value into a JSON file.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, value).map_err(|err| Error::Format(err.to_string()))?;
    writer.flush()?;
    Ok(())
}

// Deserialize a value from a JSON file.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|err| Error::Format(err.to_string()))
}

impl Container {
    pub(crate) fn from_map(map: &HashMap) -> Container {
        let (keys, values) = map.active_entries();

        Container {
            version: VERSION,
            capacity: map.capacity(),
            device: map.device(),
            backend: map.requested_backend(),
            key: Layout {
                dtype: map.key_dtype(),
                shape: map.key_element_shape().to_vec(),
            },
            values: map
                .value_dtypes()
                .iter()
                .zip(map.value_element_shapes())
                .map(|(&dtype, shape)| Layout {
                    dtype,
                    shape: shape.clone(),
                })
                .collect(),
            active_count: keys.len(),
            keys: STANDARD.encode(keys.as_bytes()),
            values_data: values
                .iter()
                .map(|value| STANDARD.encode(value.as_bytes()))
                .collect(),
        }
    }

    // Rebuild the map on `device`, re-inserting every entry.
    pub(crate) fn into_map(self, device: Device) -> Result<HashMap> {
        if self.version != VERSION {
            return Err(Error::Format(format!(
                "unsupported container version {}, expected {}",
                self.version, VERSION
            )));
        }

        if self.values.len() != self.values_data.len() {
            return Err(Error::Format(format!(
                "container declares {} value channels but holds {}",
                self.values.len(),
                self.values_data.len()
            )));
        }

        let value_dtypes = self.values.iter().map(|v| v.dtype).collect::<Vec<_>>();
        let value_shapes = self.values.iter().map(|v| v.shape.clone()).collect::<Vec<_>>();

        let capacity = self.capacity.max(self.active_count).max(1);
        let mut map = HashMap::builder()
            .capacity(i64::try_from(capacity).unwrap_or(i64::MAX))
            .key(self.key.dtype, &self.key.shape)
            .values(&value_dtypes, &value_shapes)
            .device(device)
            .backend(self.backend)
            .build()?;

        if self.active_count > 0 {
            let keys = decode(&self.keys, &self.key, self.active_count, device)?;
            let values = self
                .values
                .iter()
                .zip(&self.values_data)
                .map(|(layout, data)| decode(data, layout, self.active_count, device))
                .collect::<Result<Vec<_>>>()?;

            map.insert_entries(&keys, &values, device)?;
        }

        Ok(map)
    }
}

// Decode `rows` records of the given layout.
fn decode(data: &str, layout: &Layout, rows: usize, device: Device) -> Result<Tensor> {
    let bytes = STANDARD
        .decode(data)
        .map_err(|err| Error::Format(format!("invalid record data: {}", err)))?;

    let mut shape = Vec::with_capacity(layout.shape.len() + 1);
    shape.push(rows);
    shape.extend_from_slice(&layout.shape);

    Tensor::from_bytes(&bytes, layout.dtype, &shape, device)
        .map_err(|err| Error::Format(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed() {
        let dir = std::env::temp_dir().join(format!("slabhash-io-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let path = dir.join("garbage.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load(&path, Device::CPU), Err(Error::Format(_))));

        let path = dir.join("short.json");
        std::fs::write(
            &path,
            r#"{"version":1,"capacity":4,"device":"CPU:0","backend":"Default",
                "key":{"dtype":"Int32","shape":[1]},"values":[],"active_count":2,
                "keys":"AQAAAA==","values_data":[]}"#,
        )
        .unwrap();
        assert!(matches!(load(&path, Device::CPU), Err(Error::Format(_))));

        assert!(matches!(
            load(&dir.join("missing.json"), Device::CPU),
            Err(Error::Io(_))
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
