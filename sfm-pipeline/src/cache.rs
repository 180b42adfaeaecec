use bitarray::BitArray;
use sfm_core::KeyPoint;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// The on-disk location of an image's extracted features. The file name is
/// derived from the image file name alone, so the cache is stable across
/// directory layouts.
pub(crate) fn feature_path(cache_dir: &Path, image_name: &str) -> PathBuf {
    cache_dir.join(format!("{}.features", image_name))
}

/// Persists extracted features so a later run can skip extraction. The mere
/// existence of the file is the resumability signal; no content validation
/// happens on the read side, so stale entries are the caller's
/// responsibility to clear.
pub(crate) fn write_features(
    path: &Path,
    keypoints: &[KeyPoint],
    descriptors: &[BitArray<64>],
) -> Result<(), bincode::Error> {
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, &(keypoints, descriptors))
}

pub(crate) fn read_features(
    path: &Path,
) -> Result<(Vec<KeyPoint>, Vec<BitArray<64>>), bincode::Error> {
    let reader = BufReader::new(File::open(path)?);
    bincode::deserialize_from(reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_survive_a_disk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let keypoints = vec![KeyPoint::new(1.5, 2.5), KeyPoint::new(100.0, 200.0)];
        let descriptors = vec![BitArray::new([7u8; 64]), BitArray::new([9u8; 64])];

        let path = feature_path(dir.path(), "photo.jpg");
        write_features(&path, &keypoints, &descriptors).unwrap();
        assert_eq!(path.file_name().unwrap().to_str(), Some("photo.jpg.features"));

        let (read_keypoints, read_descriptors) = read_features(&path).unwrap();
        assert_eq!(read_keypoints, keypoints);
        assert_eq!(read_descriptors, descriptors);
    }
}
