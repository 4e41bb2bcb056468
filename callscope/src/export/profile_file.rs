//! Persisted profile format
//!
//! A profile is saved as one JSON document:
//!
//! ```json
//! { "version": 1, "profile": { ... } }
//! ```
//!
//! Every collection in the document has a fixed order, so saving a loaded
//! profile reproduces the original bytes.

use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::analysis::{ProfileData, ProfileDataState};
use crate::domain::ExportError;

pub const PROFILE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ProfileDocument {
    version: u32,
    profile: ProfileDataState,
}

/// Only the version, read before committing to the full schema.
#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// Write `profile` to `writer`.
///
/// # Errors
/// `SerializationFailed` if the document cannot be encoded, `Io` if the
/// writer fails.
pub fn export_profile<W: Write>(profile: &ProfileData, writer: W) -> Result<(), ExportError> {
    let document = ProfileDocument { version: PROFILE_FORMAT_VERSION, profile: profile.to_state() };
    let mut writer = writer;
    serde_json::to_writer_pretty(&mut writer, &document).map_err(|e| {
        if e.is_io() {
            ExportError::Io(e.into())
        } else {
            ExportError::SerializationFailed(e.to_string())
        }
    })?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Read a profile written by [`export_profile`].
///
/// # Errors
/// `UnsupportedVersion` for documents of another format version, `Json`
/// for malformed documents, `CorruptProfile` for inconsistent ones.
pub fn import_profile<R: Read>(mut reader: R) -> Result<ProfileData, ExportError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;

    let probe: VersionProbe = serde_json::from_slice(&bytes)?;
    if probe.version != PROFILE_FORMAT_VERSION {
        return Err(ExportError::UnsupportedVersion(probe.version));
    }

    let document: ProfileDocument = serde_json::from_slice(&bytes)?;
    ProfileData::from_state(document.profile)
}

/// # Errors
/// As [`export_profile`], plus `Io` if the file cannot be created.
pub fn save_profile(profile: &ProfileData, path: &Path) -> Result<(), ExportError> {
    let file = File::create(path)?;
    export_profile(profile, BufWriter::new(file))?;
    info!("Profile saved to {}", path.display());
    Ok(())
}

/// # Errors
/// As [`import_profile`], plus `Io` if the file cannot be opened.
pub fn load_profile(path: &Path) -> Result<ProfileData, ExportError> {
    let file = File::open(path)?;
    let profile = import_profile(BufReader::new(file))?;
    info!("Profile loaded from {}: {} functions", path.display(), profile.function_count());
    Ok(profile)
}
