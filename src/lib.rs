//! # Print Endpoint
//!
//! Turns data-bound HTML receipts into thermal-printer output. A document
//! goes through four stages:
//!
//! 1. **Template rendering**: Jinja templates with an embedded-JSON `data`
//!    block and Markdown filters produce the final HTML, with a dithering
//!    script appended that converts `<img dither="N">` to 1-bit monochrome.
//! 2. **Capture**: a pooled headless Chrome loads the HTML in an isolated
//!    browser context and screenshots the `#content` element, clipped to the
//!    print width.
//! 3. **Raster encoding**: the bitmap becomes an ESC/POS (`GS v 0` or
//!    `ESC *`) or StarPRNT raster command, followed by line feeds.
//! 4. **Dispatch**: the device buffer is written to `<artifact>.bin` and
//!    submitted with `lp -d <queue> -o raw`.
//!
//! The HTTP endpoint acknowledges `POST /print` immediately and runs stages
//! 2-4 on a bounded worker pool. Failures are logged and recorded in a job
//! log that can be polled at `GET /jobs/{id}`; they never change the HTTP
//! response.
//!
//! ## Quick Start
//!
//! ```rust
//! use print_endpoint::{RenderContext, TemplateRenderer};
//! use serde_json::json;
//!
//! let renderer = TemplateRenderer::new();
//! let html = renderer
//!     .render(
//!         "{% data \"shop\" %}{\"name\": \"The Prancing Pony\"}{% enddata %}\
//!          <div id=\"content\">{{ shop.name }}: {{ it.total }}</div>",
//!         &RenderContext::new(json!({"total": "12 gp"})),
//!     )
//!     .unwrap();
//! assert_eq!(html, "<div id=\"content\">The Prancing Pony: 12 gp</div>");
//! ```
//!
//! ## CLI Usage
//!
//! ### Print endpoint
//! ```bash
//! print-endpoint serve --bind 0.0.0.0:3000 --printer front-counter
//! ```
//!
//! ### Offline tools
//! ```bash
//! print-endpoint render --template receipt.html --data order.json --output receipt.out.html
//! print-endpoint dither --input logo.png --output logo.dithered.png --scale 2
//! print-endpoint encode --input receipt.png --output receipt.bin --driver epson
//! print-endpoint printers
//! ```

/// Configuration and printer targets
pub mod config;

/// Error types for every pipeline stage
pub mod error;

/// Template rendering with the embedded-data directive and Markdown filters
pub mod template;

/// Error-diffusion dithering, embedded script and native implementation
pub mod dither;

/// Pool of headless Chrome processes
pub mod browser_pool;

/// HTML to bitmap capture
pub mod capture;

/// ESC/POS and StarPRNT raster encoding
pub mod encoder;

/// OS print queue dispatch
pub mod dispatch;

/// Temp directory arena for artifacts
pub mod artifacts;

/// Print jobs and their history
pub mod job;

/// Background pipeline workers
pub mod worker;

/// HTTP endpoint
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Pipeline metrics
pub mod metrics;

/// Health reporting for the endpoint
pub mod health;


pub use artifacts::*;
pub use browser_pool::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use dispatch::*;
pub use dither::*;
pub use encoder::*;
pub use error::*;
pub use health::*;
pub use job::*;
pub use metrics::*;
pub use server::*;
pub use template::*;
pub use worker::*;
