pub const FILECHAIN_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Bumped whenever the wire envelope or block hash preimage changes.
pub const PROTOCOL_VERSION: u32 = 1;

pub fn git_commit_hash() -> &'static str {
    option_env!("GIT_COMMIT_HASH").unwrap_or("unknown")
}
