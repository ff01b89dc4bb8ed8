use nimbus_core::Credentials;

/// Identity of the calling process plus the account credentials, built
/// fresh for every call.
#[derive(Debug, Clone)]
pub struct Context {
    pub uid: u32,
    pub pid: u32,
    pub security_label: String,
    pub credentials: Credentials,
}
