//! offload-client - client core for a distributed compile service
//!
//! A local build driver invokes this client instead of a C/C++ compiler.
//! The client characterizes each local compiler once per (binary, flags,
//! environment) identity, caches the result across invocations and process
//! restarts, and ships compile requests to a remote executor over HTTP.
//!
//! This crate holds the three pieces that carry the hard invariants:
//!
//! - [`file_stat`]: point-in-time file fingerprints and the conservative
//!   "could this have changed?" oracle used to invalidate cached state.
//! - [`compiler_info`]: the process-wide compiler information cache with
//!   its two-level index, disable propagation across aliased entries, and
//!   on-disk persistence.
//! - [`http`]: the transport to the remote endpoint, with socket pooling,
//!   retry/backoff, ramp-up admission, health tracking, and the
//!   network-error edge triggers the cache's peers subscribe to.
//!
//! Flag parsing, compiler probing, include scanning, and the CLI live in
//! their own components and consume these modules through the types
//! re-exported below.

pub mod compiler_info;
pub mod file_stat;
pub mod http;

pub use compiler_info::cache::{
    CompilerInfoCache, CompilerInfoValidator, DefaultValidator, Key,
};
pub use compiler_info::state::CompilerInfoState;
pub use compiler_info::table::{CompilerInfoDataTable, PersistenceError};
pub use compiler_info::{CompilerInfoData, ResourceFile};
pub use file_stat::{FileStat, INVALID_FILE_SIZE};
pub use http::auth::{
    AccessToken, AssertionSigner, AuthError, AuthSource, LuciContextAuth, OAuth2Config,
    TokenRefreshTask, TokenSupplier,
};
pub use http::pool::ConnectionCloseState;
pub use http::{
    Body, BodyState, FileDownloadBody, HttpClient, HttpError, HttpRequest, HttpResponse,
    NetworkErrorMonitor, Options, ParsedBody, Status, StatusState,
};
