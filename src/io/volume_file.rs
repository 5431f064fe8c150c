//! Binary container for birefringent volumes.
//!
//! File format: `.bvol`
//!
//! Layout (little-endian):
//! ```text
//! Header:
//!   - Magic: "BIREFVOL" (8 bytes)
//!   - Version: u32
//!   - Shape z, y, x: 3 × u64
//!   - Voxel size z, y, x (µm): 3 × f32
//!   - Description length: u32, then UTF-8 bytes
//! Data:
//!   - Δn: voxel_count × f32
//!   - Optic axis (axial, y, x): voxel_count × 3 × f32
//! ```

use crate::core::{BirefringentVolume, VolumeShape};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::Vector3;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

const MAGIC: &[u8; 8] = b"BIREFVOL";
const VERSION: u32 = 1;
/// Upper bound on the stored description, to reject garbage lengths.
const MAX_DESCRIPTION: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum VolumeFileError {
    #[error("volume file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file magic (not a .bvol file)")]
    InvalidMagic,

    #[error("unsupported .bvol version: {0}")]
    UnsupportedVersion(u32),

    #[error("invalid volume data: {0}")]
    InvalidData(String),
}

/// Save `volume` with a free-text description.
pub fn save_volume<P: AsRef<Path>>(
    path: P,
    volume: &BirefringentVolume,
    description: &str,
) -> Result<(), VolumeFileError> {
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut w = BufWriter::new(File::create(path)?);
    write_volume(&mut w, volume, description)?;
    w.flush()?;
    Ok(())
}

/// Load a volume and its description.
pub fn load_volume<P: AsRef<Path>>(path: P) -> Result<(BirefringentVolume, String), VolumeFileError> {
    let mut r = BufReader::new(File::open(path)?);
    read_volume(&mut r)
}

pub fn write_volume<W: Write>(
    w: &mut W,
    volume: &BirefringentVolume,
    description: &str,
) -> Result<(), VolumeFileError> {
    let n = volume.shape.voxel_count();
    if volume.birefringence.len() != n || volume.optic_axis.len() != n {
        return Err(VolumeFileError::InvalidData(format!(
            "shape {:?} holds {n} voxels but buffers have {} and {}",
            volume.shape,
            volume.birefringence.len(),
            volume.optic_axis.len()
        )));
    }

    w.write_all(MAGIC)?;
    w.write_u32::<LittleEndian>(VERSION)?;
    for d in [volume.shape.z, volume.shape.y, volume.shape.x] {
        w.write_u64::<LittleEndian>(d as u64)?;
    }
    for s in volume.voxel_size_um {
        w.write_f32::<LittleEndian>(s)?;
    }
    let desc = description.as_bytes();
    w.write_u32::<LittleEndian>(desc.len() as u32)?;
    w.write_all(desc)?;

    for &dn in &volume.birefringence {
        w.write_f32::<LittleEndian>(dn)?;
    }
    for a in &volume.optic_axis {
        w.write_f32::<LittleEndian>(a.x)?;
        w.write_f32::<LittleEndian>(a.y)?;
        w.write_f32::<LittleEndian>(a.z)?;
    }
    Ok(())
}

pub fn read_volume<R: Read>(r: &mut R) -> Result<(BirefringentVolume, String), VolumeFileError> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(VolumeFileError::InvalidMagic);
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(VolumeFileError::UnsupportedVersion(version));
    }

    let mut dims = [0usize; 3];
    for d in dims.iter_mut() {
        *d = r.read_u64::<LittleEndian>()? as usize;
    }
    let shape = VolumeShape::from_array(dims);
    let mut voxel_size_um = [0.0f32; 3];
    for s in voxel_size_um.iter_mut() {
        *s = r.read_f32::<LittleEndian>()?;
    }

    let desc_len = r.read_u32::<LittleEndian>()? as usize;
    if desc_len > MAX_DESCRIPTION {
        return Err(VolumeFileError::InvalidData(format!(
            "description length {desc_len} is too large"
        )));
    }
    let mut desc = vec![0u8; desc_len];
    r.read_exact(&mut desc)?;
    let description = String::from_utf8(desc)
        .map_err(|e| VolumeFileError::InvalidData(format!("description is not UTF-8: {e}")))?;

    let n = shape.voxel_count();
    let mut birefringence = vec![0.0f32; n];
    r.read_f32_into::<LittleEndian>(&mut birefringence)?;
    let mut optic_axis = Vec::with_capacity(n);
    for _ in 0..n {
        let x = r.read_f32::<LittleEndian>()?;
        let y = r.read_f32::<LittleEndian>()?;
        let z = r.read_f32::<LittleEndian>()?;
        optic_axis.push(Vector3::new(x, y, z));
    }

    Ok((
        BirefringentVolume {
            shape,
            voxel_size_um,
            birefringence,
            optic_axis,
        },
        description,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::NamedTempFile;

    #[test]
    fn test_save_load_preserves_volume_and_description() {
        let mut rng = StdRng::seed_from_u64(11);
        let vol = BirefringentVolume::random(VolumeShape::new(2, 3, 4), [0.5, 1.0, 1.5], (-0.01, 0.01), &mut rng);
        let file = NamedTempFile::new().unwrap();
        save_volume(file.path(), &vol, "after 5 iterations").unwrap();

        let (loaded, desc) = load_volume(file.path()).unwrap();
        assert_eq!(loaded, vol);
        assert_eq!(desc, "after 5 iterations");
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let bytes = b"NOTAVOLUMEFILE..........".to_vec();
        assert!(matches!(
            read_volume(&mut bytes.as_slice()),
            Err(VolumeFileError::InvalidMagic)
        ));
    }

    #[test]
    fn test_truncated_data_is_an_error() {
        let vol = BirefringentVolume::zeros(VolumeShape::new(1, 2, 2), [1.0; 3]);
        let mut buf = Vec::new();
        write_volume(&mut buf, &vol, "").unwrap();
        buf.truncate(buf.len() - 5);
        assert!(matches!(read_volume(&mut buf.as_slice()), Err(VolumeFileError::Io(_))));
    }
}
