//! Deckflow - Parallel Extraction Pipeline for Slide Decks
//!
//! Deckflow parses compound documents (presentations and similar multi-unit files) by fanning
//! their units out to a pool of external extractor workers. Results are cached by content hash
//! in memory and on disk, and unit failures degrade to placeholders instead of failing the
//! whole document.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use deckflow::{DocumentParser, ParseOptions, ParserConfig};
//!
//! # async fn demo() -> deckflow::Result<()> {
//! let config = ParserConfig {
//!     extractor_script: Some("extract_deck.py".into()),
//!     ..Default::default()
//! };
//! let parser = DocumentParser::new(config)?;
//! let result = parser.parse("roadmap.pptx", ParseOptions::default()).await?;
//! for text in deckflow::extract_texts(&result) {
//!     println!("{}", text);
//! }
//! parser.dispose().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Core Module** (`core`): the [`DocumentParser`] orchestrator and configuration loading
//! - **Workers** (`workers`): the [`WorkerPool`] and the [`UnitExtractor`] boundary
//! - **Cache** (`cache`): the two-tier [`TwoTierCache`] and the document result cache
//! - **I/O** (`io`): pooled streaming copy, gzip and hashing
//! - **Diagnostics** (`diagnostics`): the bounded structured [`ErrorRecorder`]

#![deny(unsafe_code)]

pub mod cache;
pub mod core;
pub mod diagnostics;
pub mod error;
pub mod io;
pub mod types;
pub mod utils;
pub mod workers;

pub use error::{DeckflowError, Result};
pub use types::*;

pub use cache::{CacheConfig, CacheStats, DocumentCache, TwoTierCache};
pub use core::config::{DocumentCacheConfig, ParserConfig};
pub use core::parser::DocumentParser;
pub use core::text::{extract_texts, text_with_positions};
pub use diagnostics::{ErrorAnalysis, ErrorRecorder, Severity, StructuredError};
pub use io::StreamingIo;
pub use utils::pool::{BufferPool, PooledBuffer};
pub use workers::{SubprocessExtractor, TaskKind, UnitExtractor, UnitRequest, WorkerPool, WorkerPoolConfig};
