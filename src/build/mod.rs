//! Build pipeline: file tree in, routes and namespace out.
//!
//! The scanner walks the template root in lexical order and classifies each
//! file; the static loader verifies and indexes assets; the template loader
//! parses sources into the shared namespace and derives routes. Instance
//! assembly lives in `server::instance`.

pub mod assets;
pub mod minify;
pub mod scan;
pub mod templates;

pub use assets::{EncodingVariant, FileInfo, StaticSet};
pub use templates::{DerivedRoute, RouteKind};
