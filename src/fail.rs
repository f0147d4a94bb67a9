//! Typed failures surfaced by this crate, in the same vein as `protocols::posix`'s
//! `Fail` enum but built with [`custom_error`] so each variant carries its own
//! display template instead of a hand-rolled `impl Display`.

use custom_error::custom_error;

custom_error! {
    /// Either a file-open failure (raised synchronously from construction,
    /// or swallowed as a back-off when it happens on the opportunistic
    /// replacement path) or a read failure (surfaced through a request's
    /// future).
    #[derive(Clone)]
    pub Fail

    FileOpen {
        name: String,
        flags: u32,
        mode: u32,
        status: String,
        errno: i32,
        code: i32,
        active_sources: Vec<String>,
    } = "XrdCl::File::Open(name='{name}', flags=0x{flags:x}, mode=0o{mode:o}) => error '{status}' (errno={errno}, code={code}); active sources: {active_sources:?}",

    Read {
        name: String,
        status: String,
        errno: i32,
        code: i32,
        active_sources: Vec<String>,
    } = "read from '{name}' failed: '{status}' (errno={errno}, code={code}); active sources: {active_sources:?}",

    /// The wire layer dropped a completion handler without ever calling it
    /// back (e.g. the mock wire was torn down mid-flight). Never raised by a
    /// real wire implementation; exists so a request's future always
    /// resolves exactly once.
    Cancelled { details: String } = "request cancelled: {details}",
}
