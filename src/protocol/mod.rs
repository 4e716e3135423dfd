pub mod login;
pub mod report;
pub mod retry;
pub mod wait;

pub use login::{LoginSpec, Marker, SsoHop, SubmitAction};
pub use report::{
    download_report, interpret_report_url, ContextSelector, PaginatedList, ReportStrategy,
};
pub use retry::{retry, RetryPolicy};
pub use wait::await_artifact;
