//! Single-file packages of a collected dataset
//!
//! Layout: `MAGIC(8) | u32 BE header length | header JSON | stream`, where the
//! stream is `tar`, optionally zstd-compressed, optionally wrapped in the
//! hybrid encryption of [`crypto`]. The header is always plaintext so the
//! uploader can describe a package without the private key.

pub mod crypto;
mod uuid;


pub use crypto::{load_private_key, load_public_key, DecryptReader, EncryptWriter};
pub use uuid::{fnv32, fnv64, fnv64_hex, package_uuid, uuid_from};

use crate::error::{DiagError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Leading bytes of every package
pub const MAGIC: [u8; 8] = *b"D1AGPKG1";

/// Name of the dataset manifest a package must contain
pub const CLUSTER_JSON: &str = "cluster.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encryption {
    #[serde(rename = "rsa-aes-cfb")]
    RsaAesCfb,
    #[serde(rename = "none")]
    None,
}

impl Encryption {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RsaAesCfb => "rsa-aes-cfb",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Zstd,
    None,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zstd => "zstd",
            Self::None => "none",
        }
    }
}

/// Plaintext description of a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageHeader {
    pub cluster_id: String,
    pub cluster_type: String,
    pub encryption: Encryption,
    pub compression: Compression,
    #[serde(default)]
    pub ext: String,
}

/// Serialize a header with magic and length prefix
pub fn generate_header(header: &PackageHeader) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(header)?;
    let len = u32::try_from(json.len())
        .map_err(|_| DiagError::Bug(format!("package header of {} bytes", json.len())))?;
    let mut out = Vec::with_capacity(MAGIC.len() + 4 + json.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// Read a header from the start of `reader`, returning it with the stream offset
pub fn parse_header<R: Read>(reader: &mut R) -> Result<(PackageHeader, u64)> {
    let mut magic = [0u8; 8];
    reader
        .read_exact(&mut magic)
        .map_err(|e| DiagError::parse(format!("package too short: {}", e)))?;
    if magic != MAGIC {
        return Err(DiagError::parse("not a diag package (bad magic)"));
    }
    let mut len = [0u8; 4];
    reader
        .read_exact(&mut len)
        .map_err(|e| DiagError::parse(format!("truncated package header: {}", e)))?;
    let len = u32::from_be_bytes(len) as usize;
    let mut json = vec![0u8; len];
    reader
        .read_exact(&mut json)
        .map_err(|e| DiagError::parse(format!("truncated package header: {}", e)))?;
    let header: PackageHeader = serde_json::from_slice(&json)?;
    Ok((header, (MAGIC.len() + 4 + len) as u64))
}

/// Header and offset of a package on disk
pub fn read_header(path: &Path) -> Result<(PackageHeader, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    parse_header(&mut file)
}

/// Inputs of [`package`]
#[derive(Debug, Clone)]
pub struct PackageOptions {
    pub input_dir: PathBuf,
    /// Defaults to `<basename(input)>.diag` in the working directory
    pub output: Option<PathBuf>,
    /// Recipient public key or certificate; `None` writes an unencrypted package
    pub recipient: Option<PathBuf>,
    pub compression: Compression,
}

impl PackageOptions {
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output: None,
            recipient: None,
            compression: Compression::Zstd,
        }
    }
}

/// `<basename(input)>.diag`
pub fn default_output(input_dir: &Path) -> Result<PathBuf> {
    let base = input_dir
        .canonicalize()?
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| DiagError::parse(format!("{} has no base name", input_dir.display())))?;
    Ok(PathBuf::from(format!("{}.diag", base)))
}

/// Cluster id and type recorded in `cluster.json`
fn identity_of(input_dir: &Path) -> Result<(String, String, String)> {
    let path = input_dir.join(CLUSTER_JSON);
    let body = std::fs::read(&path).map_err(|_| {
        DiagError::parse(format!(
            "{} is not a collected data directory (no {})",
            input_dir.display(),
            CLUSTER_JSON
        ))
    })?;
    let doc: serde_json::Value = serde_json::from_slice(&body)?;
    let cluster_id = match &doc["cluster_id"] {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    };
    let cluster_type = doc["cluster_type"]
        .as_str()
        .ok_or_else(|| DiagError::parse(format!("cluster_type missing in {}", path.display())))?
        .to_string();
    let ext = serde_json::json!({
        "begin_time": doc["begin_time"],
        "end_time": doc["end_time"],
    })
    .to_string();
    Ok((cluster_id, cluster_type, ext))
}

/// Files and directories under `root`, parents first, sorted by name
fn walk(root: &Path, rel: &Path, out: &mut Vec<(PathBuf, PathBuf, bool)>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(root.join(rel))?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = rel.join(entry.file_name());
        let ty = entry.file_type()?;
        if ty.is_dir() {
            out.push((entry.path(), name.clone(), true));
            walk(root, &name, out)?;
        } else if ty.is_file() {
            out.push((entry.path(), name, false));
        }
    }
    Ok(())
}

fn write_tar<W: Write>(input_dir: &Path, sink: W) -> Result<W> {
    let mut entries = Vec::new();
    walk(input_dir, Path::new(""), &mut entries)?;

    let mut builder = tar::Builder::new(sink);
    builder.follow_symlinks(false);
    for (path, name, is_dir) in entries {
        if is_dir {
            builder.append_dir(&name, &path)?;
        } else {
            builder.append_path_with_name(&path, &name)?;
        }
    }
    Ok(builder.into_inner()?)
}

fn write_stream<W: Write>(input_dir: &Path, compression: Compression, sink: W) -> Result<W> {
    match compression {
        Compression::Zstd => {
            let encoder = zstd::Encoder::new(sink, 0)?;
            Ok(write_tar(input_dir, encoder)?.finish()?)
        }
        Compression::None => write_tar(input_dir, sink),
    }
}

/// Pack a dataset directory into a single file; returns the output path
pub fn package(opts: &PackageOptions) -> Result<PathBuf> {
    let (cluster_id, cluster_type, ext) = identity_of(&opts.input_dir)?;
    let output = match &opts.output {
        Some(o) => o.clone(),
        None => default_output(&opts.input_dir)?,
    };

    let recipient = match &opts.recipient {
        Some(path) => Some(load_public_key(path)?),
        None => {
            warn!(input = %opts.input_dir.display(), "No recipient key configured, package will not be encrypted");
            None
        }
    };
    if cluster_id.is_empty() {
        warn!(input = %opts.input_dir.display(), "cluster.json carries no cluster id");
    }

    let header = PackageHeader {
        cluster_id,
        cluster_type,
        encryption: if recipient.is_some() {
            Encryption::RsaAesCfb
        } else {
            Encryption::None
        },
        compression: opts.compression,
        ext,
    };

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&output)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => DiagError::Io(std::io::Error::new(
                e.kind(),
                format!("{} already exists", output.display()),
            )),
            _ => DiagError::Io(e),
        })?;
    let mut sink = BufWriter::new(file);
    sink.write_all(&generate_header(&header)?)?;

    let result = match &recipient {
        Some(key) => {
            let enc = EncryptWriter::new(key, sink)?;
            write_stream(&opts.input_dir, opts.compression, enc)
                .and_then(|enc| Ok(enc.into_inner()?))
                .and_then(|mut w| Ok(w.flush()?))
        }
        None => write_stream(&opts.input_dir, opts.compression, sink).and_then(|mut w| Ok(w.flush()?)),
    };
    if let Err(e) = result {
        let _ = std::fs::remove_file(&output);
        return Err(e);
    }

    info!(
        input = %opts.input_dir.display(),
        output = %output.display(),
        encryption = header.encryption.as_str(),
        compression = header.compression.as_str(),
        "Packaged collected data"
    );
    Ok(output)
}

/// Run [`package`] off the async runtime; a panic in the writer becomes [`DiagError::Bug`]
pub async fn package_blocking(opts: PackageOptions) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || package(&opts)).await?
}

/// Unpack a package into `out_dir`, decrypting with `key` when needed
pub fn unpack(package: &Path, key: Option<&Path>, out_dir: &Path) -> Result<PackageHeader> {
    let mut reader = BufReader::new(File::open(package)?);
    let (header, _) = parse_header(&mut reader)?;

    let stream: Box<dyn Read> = match header.encryption {
        Encryption::RsaAesCfb => {
            let path = key.ok_or_else(|| {
                DiagError::CryptoKey("package is encrypted, a private key is required".to_string())
            })?;
            let private = load_private_key(path)?;
            Box::new(DecryptReader::new(&private, reader)?)
        }
        Encryption::None => Box::new(reader),
    };
    let stream: Box<dyn Read> = match header.compression {
        Compression::Zstd => Box::new(zstd::Decoder::new(stream)?),
        Compression::None => stream,
    };

    std::fs::create_dir_all(out_dir)?;
    tar::Archive::new(stream).unpack(out_dir)?;
    info!(package = %package.display(), output = %out_dir.display(), "Unpacked package");
    Ok(header)
}
