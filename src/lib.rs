//! mcdf - Compound File Binary (OLE2 structured storage) engine
//!
//! This library reads, edits and writes compound files: a single flat file
//! hosting a hierarchy of named storages (folders) and streams (payloads), the
//! container format behind legacy Office documents (.doc, .xls, .ppt), MSI
//! packages and thumbnail caches.
//!
//! # Features
//!
//! - **Both generations**: version 3 (512-byte sectors) and version 4 (4096-byte sectors)
//! - **Transacted update**: `commit` writes only the sectors changed since open
//! - **Full save**: `save`/`save_to` write a complete image to a new destination
//! - **Compaction**: `shrink` rebuilds a file without free sectors, via a temporary file
//! - **Small streams**: payloads under 4096 bytes live in the MiniFAT-managed mini stream
//!   and migrate automatically when they cross the cutoff
//! - **Corruption checks**: cyclic or out-of-range FAT, MiniFAT and DIFAT chains and
//!   malformed directory trees are rejected at open time
//!
//! # Example - Creating a file
//!
//! ```no_run
//! use mcdf::CompoundFile;
//!
//! # fn main() -> Result<(), mcdf::Error> {
//! let cf = CompoundFile::new();
//! let root = cf.root_storage();
//!
//! root.add_stream("Summary")?.set_data(b"Hello, World!")?;
//! let storage = root.add_storage("Macros")?;
//! storage.add_stream("Module1")?.set_data(&[0u8; 10_000])?;
//!
//! cf.save("output.cfs")?;
//! # Ok(())
//! # }
//! ```
//!
//! # Example - Reading and updating a file
//!
//! ```no_run
//! use mcdf::{CfItem, CompoundFile, Configuration, UpdateMode};
//!
//! # fn main() -> Result<(), mcdf::Error> {
//! let cf = CompoundFile::open("output.cfs", UpdateMode::Update, Configuration::SECTOR_RECYCLE)?;
//! let root = cf.root_storage();
//!
//! root.visit_entries(|entry| println!("{}", entry.name().unwrap_or_default()), true)?;
//!
//! let stream = root.get_stream("Summary")?;
//! stream.append(b" More text.")?;
//! root.delete("Macros")?;
//! cf.commit()?;
//! # Ok(())
//! # }
//! ```

mod binary;
pub mod config;
pub mod consts;
mod difat;
mod directory;
pub mod error;
mod fat;
mod file;
mod header;
mod item;
mod minifat;
mod sector;

pub use config::{Configuration, UpdateMode, Version};
pub use directory::Clsid;
pub use error::{Error, Result};
pub use file::CompoundFile;
pub use item::{CfItem, Entry, Storage, Stream};
pub use sector::ByteStore;
