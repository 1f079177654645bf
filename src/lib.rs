//! pario - file lifecycle coordination and write aggregation for parallel I/O
//!
//! pario sits between the ranks of a parallel program and a set of storage
//! backends. It keeps every rank's view of an open file consistent while the
//! actual backend calls run only on the ranks doing I/O, and it aggregates
//! many small distributed-array writes into a few large backend writes.
//!
//! - **Two topologies**: every rank does I/O (synchronous), or disjoint
//!   computational and I/O groups joined by an intercommunicator, with the
//!   I/O group serving requests in a message loop (asynchronous)
//! - **Four backend formats** with their own call discipline: classic,
//!   classic-extended, parallel and collective-buffered, with a one-shot
//!   fallback to classic when a parallel format cannot open a file
//! - **Write aggregation**: writes are staged per file in chains of buffer
//!   nodes and flushed collectively on sync and close
//!
//! # Architecture
//!
//! - **Communication** ([`comm`]): the [`comm::Communicator`] trait, an
//!   in-process thread transport and an optional MPI transport
//! - **I/O system** ([`iosystem`]): topology, roles and the request
//!   protocol between the groups
//! - **Storage** ([`storage`]): backend trait, per-format dispatch and an
//!   in-memory backend
//! - **Buffering** ([`buffer`]): write staging and collective flush
//! - **API** ([`api`]): the [`Pio`] instance and its file operations
//!
//! # Example
//!
//! ```rust,no_run
//! use pario::{IoFormat, OpenMode, Pio, PioConfig, StagedWrite};
//! use pario::comm::LocalComm;
//! use pario::storage::MemoryStore;
//!
//! # fn example() -> Result<(), pario::PioError> {
//! let store = MemoryStore::new();
//! let mut pio = Pio::with_memory_store(PioConfig::default(), &store);
//! let iosysid = pio.init_intracomm(Box::new(LocalComm::world(1).remove(0)))?;
//!
//! let fh = pio.create(iosysid, "out.nc", IoFormat::Classic, OpenMode::WRITE)?;
//! pio.write_darray(
//!     fh,
//!     StagedWrite { var_id: 1, decomp_id: 1, frame: Some(0), data: vec![0; 16], fill: None },
//! )?;
//! pio.close(fh)?;
//! pio.finalize(iosysid)?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod buffer;
pub mod comm;
pub mod config;
pub mod constants;
pub mod error;
pub mod iosystem;
pub mod logging;
pub mod storage;

pub use api::{FileDesc, Pio};
pub use buffer::StagedWrite;
pub use config::PioConfig;
pub use error::{PioError, PioResult};
pub use iosystem::{IoSystem, TaskGroup};
pub use storage::{IoFormat, OpenMode};
