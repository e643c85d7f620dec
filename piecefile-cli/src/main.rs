use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use piecefile_core::chunk::{Hash, HASH_SIZE};
use piecefile_core::erasure::RsCodec;
use piecefile_core::merkle::piece_root;
use piecefile_core::recovery::Loader;
use piecefile_core::{
    Dependencies, ErasureConfig, FileConfig, HostPublicKey, PieceFile, ProductionDependencies,
    Specifier, Wal,
};

#[derive(Parser)]
#[command(name = "piecefile", version, about = "Crash-safe piece tables for erasure-coded files")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Args)]
struct Target {
    /// Piece file
    file: PathBuf,
    /// Write-ahead log [default: <FILE>.wal]
    #[arg(long)]
    wal: Option<PathBuf>,
    /// Attempts to re-run recovery after a disk fault
    #[arg(long, default_value_t = 3)]
    retries: u32,
}

impl Target {
    fn wal_path(&self) -> PathBuf {
        self.wal.clone().unwrap_or_else(|| {
            let mut name = self.file.clone().into_os_string();
            name.push(".wal");
            PathBuf::from(name)
        })
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Create a new piece file
    Create {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        remote_path: String,
        /// Local copy of the data; sets the size and local path
        #[arg(long, conflicts_with = "size", required_unless_present = "size")]
        source: Option<PathBuf>,
        #[arg(long)]
        size: Option<u64>,
        #[arg(long, default_value_t = 1 << 22)]
        piece_size: u64,
        #[arg(long, default_value_t = 10)]
        data_pieces: u32,
        #[arg(long, default_value_t = 20)]
        parity_pieces: u32,
        /// Octal permission bits
        #[arg(long, default_value = "644")]
        mode: String,
    },
    /// Print metadata, host keys and piece table
    Inspect {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Record a piece stored on a host
    AddPiece {
        #[command(flatten)]
        target: Target,
        /// Host public key, hex
        #[arg(long)]
        host_key: String,
        #[arg(long, default_value = "ed25519")]
        algorithm: String,
        #[arg(long)]
        chunk: u64,
        #[arg(long)]
        piece: u32,
        /// Piece hash, hex
        #[arg(long, conflicts_with = "from_source", required_unless_present = "from_source")]
        hash: Option<String>,
        /// Derive the hash by encoding the chunk from the local source file
        #[arg(long, default_value_t = false)]
        from_source: bool,
    },
    /// Replay the write-ahead log and check the file loads
    Recover {
        #[command(flatten)]
        target: Target,
    },
    /// Remove the piece file
    Delete {
        #[command(flatten)]
        target: Target,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Create { target, remote_path, source, size, piece_size, data_pieces, parity_pieces, mode } => {
            create(&target, remote_path, source.as_deref(), size, piece_size, data_pieces, parity_pieces, &mode)?
        }
        Cmd::Inspect { target, json } => inspect(&target, json)?,
        Cmd::AddPiece { target, host_key, algorithm, chunk, piece, hash, from_source } => {
            add_piece(&target, &host_key, &algorithm, chunk, piece, hash.as_deref(), from_source)?
        }
        Cmd::Recover { target } => recover(&target)?,
        Cmd::Delete { target } => delete(&target)?,
    }
    Ok(())
}

fn deps() -> Arc<dyn Dependencies> {
    Arc::new(ProductionDependencies)
}

fn hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push(HEX[(b >> 4) as usize] as char);
        s.push(HEX[(b & 0xF) as usize] as char);
    }
    s
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        bail!("odd-length hex string");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| anyhow!("bad hex at {}", i))
        })
        .collect()
}

fn open(target: &Target) -> Result<PieceFile> {
    let wal = target.wal_path();
    let mut loader = Loader::new(&target.file, &wal, deps());
    loop {
        match loader.load() {
            Ok(pf) => {
                let replayed = loader.replayed();
                if replayed.transactions > 0 {
                    eprintln!(
                        "Replayed {} transaction(s), {} update(s)",
                        replayed.transactions, replayed.updates
                    );
                }
                return Ok(pf);
            }
            // Structural errors repeat on every attempt.
            Err(e) if e.is_disk_fault() && loader.attempts() <= target.retries => {
                warn!(attempt = loader.attempts(), error = %e, "recovery failed, retrying");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("open {} (log {})", target.file.display(), wal.display()))
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn create(
    target: &Target,
    remote_path: String,
    source: Option<&Path>,
    size: Option<u64>,
    piece_size: u64,
    data_pieces: u32,
    parity_pieces: u32,
    mode: &str,
) -> Result<()> {
    if target.file.exists() {
        bail!("{} already exists", target.file.display());
    }
    let mode = u32::from_str_radix(mode, 8).with_context(|| format!("bad mode {mode}"))?;
    let erasure = ErasureConfig::new(data_pieces, parity_pieces);
    let (file_size, local_path) = match source {
        Some(src) => {
            let md = std::fs::metadata(src).with_context(|| format!("stat {}", src.display()))?;
            let abs = src.canonicalize().with_context(|| format!("resolve {}", src.display()))?;
            let local = abs.to_str().ok_or_else(|| anyhow!("non UTF-8 path {}", abs.display()))?;
            (md.len(), local.to_string())
        }
        None => (size.unwrap_or(0), String::new()),
    };

    let mut cfg = FileConfig::new(remote_path, erasure, piece_size, file_size);
    cfg.local_path = local_path;
    cfg.mode = mode;

    let (pending, wal) = Wal::open(target.wal_path())?;
    if !pending.is_empty() {
        bail!("log {} has {} pending transaction(s); run recover first", target.wal_path().display(), pending.len());
    }
    let pf = PieceFile::create(&target.file, cfg, wal, deps())
        .with_context(|| format!("create {}", target.file.display()))?;
    eprintln!(
        "Created {}: {} chunk(s), {}-of-{} pieces of {} bytes",
        target.file.display(),
        pf.num_chunks(),
        erasure.min_pieces,
        erasure.num_pieces,
        pf.piece_size()
    );
    Ok(())
}

#[derive(Serialize)]
struct HostReport {
    index: u32,
    algorithm: String,
    key: String,
}

#[derive(Serialize)]
struct PieceReport {
    piece: u32,
    host: u32,
    hash: String,
}

#[derive(Serialize)]
struct ChunkReport {
    chunk: u64,
    pieces: Vec<PieceReport>,
}

#[derive(Serialize)]
struct Report {
    path: String,
    version: u32,
    file_size: u64,
    piece_size: u64,
    chunk_size: u64,
    num_pieces: u32,
    min_pieces: u32,
    local_path: String,
    remote_path: String,
    mode: String,
    uid: u32,
    gid: u32,
    mod_time: String,
    change_time: String,
    access_time: String,
    create_time: String,
    pub_key_table_offset: u64,
    chunk_offset: u64,
    chunk_metadata_size: u64,
    redundancy: f64,
    available: bool,
    hosts: Vec<HostReport>,
    chunks: Vec<ChunkReport>,
}

fn report(pf: &PieceFile) -> Report {
    let md = pf.metadata();
    let hosts = pf
        .host_public_keys()
        .iter()
        .enumerate()
        .map(|(i, k)| HostReport { index: i as u32, algorithm: k.algorithm.to_string(), key: hex(&k.key) })
        .collect();
    let chunks = (0..pf.num_chunks())
        .filter_map(|c| pf.chunk(c).ok().map(|chunk| (c, chunk)))
        .map(|(c, chunk)| ChunkReport {
            chunk: c,
            pieces: chunk
                .pieces()
                .iter()
                .flatten()
                .map(|p| PieceReport { piece: p.piece_index, host: p.host_key_index, hash: hex(&p.hash) })
                .collect(),
        })
        .collect();
    Report {
        path: pf.path().display().to_string(),
        version: md.version,
        file_size: md.file_size,
        piece_size: md.piece_size,
        chunk_size: md.chunk_size(),
        num_pieces: md.erasure.num_pieces,
        min_pieces: md.erasure.min_pieces,
        local_path: md.local_path.clone(),
        remote_path: md.remote_path.clone(),
        mode: format!("{:o}", md.mode),
        uid: md.uid,
        gid: md.gid,
        mod_time: md.mod_time.to_rfc3339(),
        change_time: md.change_time.to_rfc3339(),
        access_time: md.access_time.to_rfc3339(),
        create_time: md.create_time.to_rfc3339(),
        pub_key_table_offset: md.pub_key_table_offset,
        chunk_offset: md.chunk_offset,
        chunk_metadata_size: md.chunk_metadata_size,
        redundancy: pf.redundancy(),
        available: pf.available(),
        hosts,
        chunks,
    }
}

fn inspect(target: &Target, json: bool) -> Result<()> {
    let pf = open(target)?;
    let r = report(&pf);
    if json {
        println!("{}", serde_json::to_string_pretty(&r)?);
        return Ok(());
    }
    println!("File:        {}", r.path);
    println!("Remote path: {}", r.remote_path);
    if !r.local_path.is_empty() {
        println!("Local path:  {}", r.local_path);
    }
    println!("Size:        {} bytes, mode {}, uid {} gid {}", r.file_size, r.mode, r.uid, r.gid);
    println!("Erasure:     {}-of-{}, piece {} bytes, chunk {} bytes", r.min_pieces, r.num_pieces, r.piece_size, r.chunk_size);
    println!("Layout:      key table @{}, chunk table @{} ({} bytes/chunk)", r.pub_key_table_offset, r.chunk_offset, r.chunk_metadata_size);
    println!("Modified:    {}", r.mod_time);
    println!("Hosts:       {}", r.hosts.len());
    for h in &r.hosts {
        println!("  [{}] {} {}", h.index, h.algorithm, h.key);
    }
    for c in &r.chunks {
        println!("  chunk {:6}: {}/{} pieces", c.chunk, c.pieces.len(), r.num_pieces);
    }
    println!("Redundancy:  {:.2} ({})", r.redundancy, if r.available { "available" } else { "unavailable" });
    Ok(())
}

/// Hash of piece `piece` of chunk `chunk`, encoded from the local source.
fn hash_from_source(pf: &PieceFile, chunk: u64, piece: u32) -> Result<Hash> {
    let md = pf.metadata();
    if md.local_path.is_empty() {
        bail!("{} has no local path", pf.path().display());
    }
    let chunk_size = md.chunk_size();
    let offset = chunk
        .checked_mul(chunk_size)
        .filter(|&o| o < md.file_size.max(1))
        .ok_or_else(|| anyhow!("chunk {} beyond end of file", chunk))?;
    let len = chunk_size.min(md.file_size - offset.min(md.file_size));
    let mut buf = vec![0u8; len as usize];
    let mut f = File::open(&md.local_path).with_context(|| format!("open {}", md.local_path))?;
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(&mut buf).with_context(|| format!("read chunk {} of {}", chunk, md.local_path))?;

    let min = md.erasure.min_pieces as usize;
    let codec = RsCodec::new(min, md.erasure.num_pieces as usize - min)?;
    let pieces = codec.encode_chunk(&buf, md.piece_size as usize)?;
    let data = pieces
        .get(piece as usize)
        .ok_or_else(|| anyhow!("piece {} out of range ({} pieces)", piece, pieces.len()))?;
    Ok(piece_root(data))
}

fn add_piece(
    target: &Target,
    host_key: &str,
    algorithm: &str,
    chunk: u64,
    piece: u32,
    hash: Option<&str>,
    from_source: bool,
) -> Result<()> {
    let key = parse_hex(host_key).context("--host-key")?;
    let mut pf = open(target)?;
    let hash: Hash = match hash {
        Some(h) => parse_hex(h)
            .context("--hash")?
            .try_into()
            .map_err(|v: Vec<u8>| anyhow!("--hash must be {} bytes, got {}", HASH_SIZE, v.len()))?,
        None if from_source => hash_from_source(&pf, chunk, piece)?,
        None => bail!("either --hash or --from-source is required"),
    };
    pf.add_piece(HostPublicKey::new(Specifier::from_name(algorithm), key), chunk, piece, hash)?;
    eprintln!("Chunk {} piece {}: {}", chunk, piece, hex(&hash));
    Ok(())
}

fn recover(target: &Target) -> Result<()> {
    let pf = open(target)?;
    println!("OK: {} chunk(s), redundancy {:.2}", pf.num_chunks(), pf.redundancy());
    Ok(())
}

fn delete(target: &Target) -> Result<()> {
    let mut pf = open(target)?;
    pf.delete()?;
    eprintln!("Deleted {}", target.file.display());
    Ok(())
}
