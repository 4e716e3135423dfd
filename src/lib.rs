//! Browser-driven download orchestration for Ed-Tech report portals.
//!
//! The portals this crate talks to expose no stable API; reports exist only
//! behind a login form, a trigger button, and a file that eventually lands
//! in the browser's download directory (or, for one portal, a link that
//! eventually lands in a mailbox). The crate drives that whole sequence and
//! hands back a parsed [`Table`].
//!
//! Layering, bottom up:
//! * [`core`] — config, error taxonomy, shared types.
//! * [`tabular`] — CSV/XLSX/zip artifact parsing.
//! * [`browser`] — Chromium lifecycle, DOM helpers, session/workdir.
//! * [`protocol`] — the shared login / trigger / wait / parse pipeline.
//! * [`relay`] — the email-delivered variant of the materialization wait.
//! * [`services`] — per-portal selector data and composites.

pub mod browser;
pub mod core;
pub mod protocol;
pub mod relay;
pub mod services;
pub mod tabular;

// --- Primary exports ---
pub use browser::{Session, Workdir};
pub use core::config::{load_harvest_config, HarvestConfig};
pub use core::error::{HarvestError, Result, WaitTarget};
pub use core::types::{
    Artifact, ArtifactFormat, Credentials, ReportRequest, Table, TriggerOutcome,
};
pub use protocol::{download_report, ReportStrategy, RetryPolicy};
pub use relay::{MailboxConfig, RelayQuery};
pub use tabular::ParseOptions;
