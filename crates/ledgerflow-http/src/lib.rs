//! ledgerflow-http: grouped HTTP batch execution for bulk ledger calls.
//!
//! Sub-requests are packed into one `POST <base_url>/batch`, retried on
//! connection failures and 5xx answers, split into concurrent chunks when
//! there are too many, and matched back to their responses by `id`.
//!
//! ```rust,no_run
//! use ledgerflow_http::{HttpBatchExecutor, HttpBatchOptions, HttpBatchRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), ledgerflow_http::BatchError> {
//! let executor = HttpBatchExecutor::new("https://ledger.example.com", HttpBatchOptions::default())
//!     .with_auth_token("secret");
//! let requests = vec![
//!     HttpBatchRequest::get("/v1/accounts/a1/balances"),
//!     HttpBatchRequest::get("/v1/accounts/a2/balances"),
//! ];
//! let result = executor.execute_batch(&CancellationToken::new(), requests).await?;
//! let balance: Option<serde_json::Value> = result.parse_response("req_0")?;
//! # let _ = balance;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod executor;
pub mod options;
pub mod request;

pub use error::{BatchError, ErrorKind};
pub use executor::HttpBatchExecutor;
pub use options::HttpBatchOptions;
pub use request::{parse_response, HttpBatchRequest, HttpBatchResponse, HttpBatchResult};
