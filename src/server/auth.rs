/// Validates login/passcode pairs presented in CONNECT frames.
///
/// When the server has no authenticator configured, every connection is
/// accepted. A rejected login is answered with an ERROR frame after a one
/// second delay to slow down credential guessing.
pub trait Authenticator: Send + Sync {
    /// Returns true when the credentials are acceptable. Either value is
    /// `None` when the client omitted the corresponding header.
    fn authenticate(&self, login: Option<&str>, passcode: Option<&str>) -> bool;
}

impl<F> Authenticator for F
where
    F: Fn(Option<&str>, Option<&str>) -> bool + Send + Sync,
{
    fn authenticate(&self, login: Option<&str>, passcode: Option<&str>) -> bool {
        self(login, passcode)
    }
}
