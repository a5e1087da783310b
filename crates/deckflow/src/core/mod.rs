//! Parsing orchestration.
//!
//! - **Configuration** (`config`): [`ParserConfig`] and its file/environment loaders
//! - **Parser** (`parser`): [`DocumentParser`], which drives validation, caching, batching and fallback
//! - **Text** (`text`): plain-text views of a parse result
//!
//! # Example
//!
//! ```rust,no_run
//! use deckflow::core::{DocumentParser, ParserConfig};
//! use deckflow::ParseOptions;
//!
//! # async fn example() -> deckflow::Result<()> {
//! let config = ParserConfig::discover()?.unwrap_or_default().with_env_overrides()?;
//! let parser = DocumentParser::new(config)?;
//! let result = parser.parse_with_fallback("deck.pptx", ParseOptions::default()).await;
//! println!("{} units", result.total_units);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod parser;
pub mod text;

pub use config::{DocumentCacheConfig, ParserConfig};
pub use parser::DocumentParser;
pub use text::{extract_texts, text_with_positions};
