//! Build-time configuration.

/// Directory containing `bin/bash`, used for the implicit `/bin/sh` symlink
/// every container receives.
///
/// Consumed from the `BASH_PATH` environment variable at build time
/// (typically a Nix store path). Falls back to `/usr`, which only resolves
/// inside a container whose embedder binds the host `/usr`.
pub const BASH_PATH: &str = match option_env!("BASH_PATH") {
    Some(path) => path,
    None => "/usr",
};

/// Directory containing `bin/env`, used for the implicit `/usr/bin/env`
/// symlink every container receives.
///
/// Consumed from the `COREUTILS_PATH` environment variable at build time.
pub const COREUTILS_PATH: &str = match option_env!("COREUTILS_PATH") {
    Some(path) => path,
    None => "/usr",
};
