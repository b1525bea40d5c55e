//! OS trap dispatch for the breakpoint engine.
//!
//! Each platform supplies `install` and `uninstall` with one contract: the
//! handler is registered process-wide, consults the breakpoint registry on
//! every trap, redirects registered hits to their stub, and passes every
//! other trap on to whatever would have received it otherwise. Both
//! functions are called under the registry lock, on first attach and last
//! detach.
use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod unix;
        pub use self::unix::{install, uninstall};
    } else if #[cfg(windows)] {
        mod windows;
        pub use self::windows::{install, uninstall};
    } else {
        compile_error!("no trap dispatch for this platform");
    }
}
