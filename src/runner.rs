// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Typed wrapper around external tool invocations.
//!
//! Everything the engine still has to spawn (`cpio`, `blkid`, `dd`,
//! `make_ext4fs`, `simg2img`, `gnutar`, mount helpers, chroot'd package
//! tools) goes through here: argv vectors only, with stderr captured into
//! the error so failures carry their diagnostics.

use std::{
    io,
    process::{Command, ExitStatus},
};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to run {0:?}")]
    Spawn(String, #[source] io::Error),
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

type Result<T> = std::result::Result<T, Error>;

fn describe(cmd: &Command) -> String {
    let mut out = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        out.push(' ');
        out.push_str(&arg.to_string_lossy());
    }
    out
}

pub trait CommandExt {
    /// Run to completion and fail on a non-zero exit status.
    fn run_checked(&mut self) -> Result<()>;

    /// Run to completion and return the captured stdout.
    fn run_capture(&mut self) -> Result<String>;

    /// Like [`CommandExt::run_checked`], but only reports the failure.
    fn run_ok(&mut self) -> bool;
}

impl CommandExt for Command {
    fn run_checked(&mut self) -> Result<()> {
        self.run_capture().map(|_| ())
    }

    fn run_capture(&mut self) -> Result<String> {
        let program = describe(self);
        debug!("Running: {program}");

        let output = self
            .output()
            .map_err(|e| Error::Spawn(program.clone(), e))?;
        if !output.status.success() {
            return Err(Error::Failed {
                program,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_ok(&mut self) -> bool {
        match self.run_checked() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("{e}");
                false
            }
        }
    }
}
