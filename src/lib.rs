//! # Batch Image Converter Library
//!
//! Questo è il modulo principale della libreria che espone tutte le API pubbliche.
//!
//! ## Architettura dei moduli:
//! - `config`: Gestione configurazione e validazione parametri
//! - `error`: Errori classificati per tipo
//! - `file_manager`: Discovery dei file e scritture atomiche
//! - `codec`: Contratto del codec e implementazione su crate `image`
//! - `converter`: Conversione singola, cache, rate limiter, worker pool
//! - `state`: Persistenza della sessione per il resume
//! - `stats`: Statistiche e report finale
//! - `progress`: Progress bar
//! - `validator`: Controlli pre-flight
//! - `batch`: Orchestratore del run
//!
//! ## Utilizzo:
//! ```rust,no_run
//! use batch_image_converter::{BatchConverter, Config};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let converter = BatchConverter::new("/photos".as_ref(), "webp", Config::default())?;
//! let outcome = converter.run().await?;
//! println!("{}", outcome.statistics.format_summary());
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod codec;
pub mod config;
pub mod converter;
pub mod error;
pub mod file_manager;
pub mod progress;
pub mod state;
pub mod stats;
pub mod validator;

pub use batch::{BatchConverter, BatchOutcome};
pub use codec::{Codec, ImageCodec, TargetFormat};
pub use config::{BatchConfig, Config, MetadataPolicy};
pub use converter::{ConversionResult, ImageConverter, Job, WorkerPool};
pub use error::{ConvertError, ErrorKind};
pub use state::{ConversionState, SessionStore};
pub use stats::ConversionStatistics;
