use crate::{Error, GrayFloatImage, Label, Result};
use ::image::DynamicImage;
use log::*;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Image paths and their class labels, kept as parallel lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub filenames: Vec<PathBuf>,
    pub labels: Vec<Label>,
}

impl Dataset {
    pub fn new(filenames: Vec<PathBuf>, labels: Vec<Label>) -> Result<Self> {
        if filenames.len() != labels.len() {
            return Err(Error::shape(
                format!("{} labels", filenames.len()),
                format!("{} labels", labels.len()),
            ));
        }
        Ok(Self { filenames, labels })
    }

    pub fn len(&self) -> usize {
        self.filenames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filenames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &Label)> {
        self.filenames.iter().zip(self.labels.iter())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = fs::File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn load_split(dir: &Path, split: &str) -> Result<Dataset> {
    let filenames: Vec<PathBuf> = read_json(&dir.join(format!("{split}_images_filenames.json")))?;
    let labels: Vec<Label> = read_json(&dir.join(format!("{split}_labels.json")))?;
    Dataset::new(filenames, labels)
}

/// Loads the images that belong to the training set and their labels.
///
/// Reads `train_images_filenames.json` and `train_labels.json` from `dir`.
pub fn load_training_set(dir: impl AsRef<Path>) -> Result<Dataset> {
    load_split(dir.as_ref(), "train")
}

/// Loads the images that belong to the test set and their labels.
pub fn load_test_set(dir: impl AsRef<Path>) -> Result<Dataset> {
    load_split(dir.as_ref(), "test")
}

pub fn load_image(path: impl AsRef<Path>) -> Result<DynamicImage> {
    Ok(::image::open(path)?)
}

pub fn load_grayscale_image(path: impl AsRef<Path>) -> Result<GrayFloatImage> {
    Ok(GrayFloatImage::from_dynamic(&load_image(path)?))
}

/// A directory of serialized objects, addressed by name.
///
/// There is no invalidation: a name that exists on disk is returned as is.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.bin"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    /// Saves an object to disk under `name`.
    pub fn save<T: Serialize>(&self, name: &str, object: &T) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let path = self.path(name);
        let mut writer = BufWriter::new(fs::File::create(&path)?);
        bincode::serialize_into(&mut writer, object)?;
        writer.flush()?;
        debug!("saved artifact {} to {}", name, path.display());
        Ok(path)
    }

    /// Loads the object previously saved under `name`.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.path(name);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MissingArtifact {
                    name: name.to_owned(),
                    path,
                })
            }
            Err(e) => return Err(e.into()),
        };
        let object = bincode::deserialize_from(BufReader::new(file))?;
        debug!("loaded artifact {} from {}", name, path.display());
        Ok(object)
    }

    /// Loads `name`, or computes it with `compute` and saves it when it cannot be read.
    ///
    /// Only read failures fall back to `compute`. A file that reads fine but does not decode
    /// as `T` is reported as an error.
    pub fn load_or_compute<T, F>(&self, name: &str, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        match self.load(name) {
            Ok(object) => {
                info!("using cached artifact {}", name);
                Ok(object)
            }
            Err(e) if e.is_io() => {
                info!("artifact {} unavailable ({}), computing it", name, e);
                let object = compute()?;
                self.save(name, &object)?;
                Ok(object)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("models"));
        store.save("numbers", &vec![1u32, 2, 3]).unwrap();
        assert!(store.contains("numbers"));
        let numbers: Vec<u32> = store.load("numbers").unwrap();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn missing_artifact_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let err = store.load::<Vec<u32>>("nothing").unwrap_err();
        assert!(matches!(err, Error::MissingArtifact { .. }));
        assert!(err.is_io());
    }

    #[test]
    fn load_or_compute_only_computes_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let calls = Cell::new(0);
        let compute = || {
            calls.set(calls.get() + 1);
            Ok(String::from("codebook"))
        };
        assert_eq!(store.load_or_compute("cb", compute).unwrap(), "codebook");
        assert_eq!(store.load_or_compute("cb", compute).unwrap(), "codebook");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn truncated_artifact_is_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.save("values", &vec![1.0f64; 16]).unwrap();
        fs::write(store.path("values"), [16u8, 0, 0]).unwrap();
        let values: Vec<f64> = store.load_or_compute("values", || Ok(vec![2.0])).unwrap();
        assert_eq!(values, vec![2.0]);
    }

    #[test]
    fn undecodable_artifact_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.save("flag", &2u8).unwrap();
        let calls = Cell::new(0);
        let err = store
            .load_or_compute("flag", || {
                calls.set(calls.get() + 1);
                Ok(true)
            })
            .unwrap_err();
        assert!(matches!(err, Error::Encode(_)));
        assert!(!err.is_io());
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn mismatched_dataset_lengths() {
        let err = Dataset::new(vec![PathBuf::from("a.jpg")], vec![]).unwrap_err();
        assert!(matches!(err, Error::Shape { .. }));
    }

    #[test]
    fn loads_json_split() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("test_images_filenames.json"),
            r#"["a.jpg", "b.jpg"]"#,
        )
        .unwrap();
        fs::write(dir.path().join("test_labels.json"), r#"["coast", "forest"]"#).unwrap();
        let set = load_test_set(dir.path()).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.labels[1], "forest");
    }
}
