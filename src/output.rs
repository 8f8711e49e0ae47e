//! Output sinks toggled by the controller.
//!
//! An output is a named boolean. The memory sink is state only, the file
//! sink persists the value as a single `'1'`/`'0'` byte at offset zero, and
//! the GPIO sink drives a pin on the target board.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::{error, warn};

pub struct Output {
    name: String,
    kind: Kind,
}

enum Kind {
    Memory {
        value: bool,
    },
    File {
        path: PathBuf,
        file: Option<File>,
    },
    Gpio {
        pin: u32,
    },
}

impl Output {
    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: Kind::Memory { value: false },
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: Kind::File {
                path: path.into(),
                file: None,
            },
        }
    }

    pub fn gpio(name: impl Into<String>, pin: u32) -> Self {
        Self {
            name: name.into(),
            kind: Kind::Gpio { pin },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires whatever the sink needs before the first toggle.
    pub fn set_up(&mut self) -> io::Result<()> {
        match &mut self.kind {
            Kind::Memory { value } => {
                *value = false;
                Ok(())
            }
            Kind::File { path, file } => {
                let opened = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&*path)
                    .map_err(|err| {
                        error!(
                            "failed to open file output {} at {}: {err}",
                            self.name,
                            path.display()
                        );
                        err
                    })?;
                *file = Some(opened);
                Ok(())
            }
            Kind::Gpio { pin } => {
                // TODO: drive the pin through the kernel GPIO character
                // device once a target board is wired up.
                error!("GPIO output {} (pin {pin}) is not supported yet", self.name);
                Err(io::ErrorKind::Unsupported.into())
            }
        }
    }

    pub fn tear_down(&mut self) {
        if let Kind::File { file, .. } = &mut self.kind {
            *file = None;
        }
    }

    pub fn value(&self) -> bool {
        match &self.kind {
            Kind::Memory { value } => *value,
            Kind::File { file, .. } => {
                let Some(mut file) = file.as_ref() else {
                    return false;
                };
                if let Err(err) = file.seek(SeekFrom::Start(0)) {
                    error!("failed to seek file output {} for reading: {err}", self.name);
                    return false;
                }
                let mut buffer = [0u8; 1];
                match file.read(&mut buffer) {
                    Ok(1) => buffer[0] == b'1',
                    _ => false,
                }
            }
            Kind::Gpio { .. } => false,
        }
    }

    pub fn set_value(&mut self, value: bool) {
        match &mut self.kind {
            Kind::Memory { value: stored } => *stored = value,
            Kind::File { file, .. } => {
                let Some(file) = file.as_mut() else {
                    warn!("file output {} was not set up", self.name);
                    return;
                };
                if let Err(err) = file.seek(SeekFrom::Start(0)) {
                    error!("failed to seek file output {} for writing: {err}", self.name);
                    return;
                }
                let byte = if value { b"1" } else { b"0" };
                if let Err(err) = file.write_all(byte) {
                    error!("failed to write value to file output {}: {err}", self.name);
                }
            }
            Kind::Gpio { .. } => {}
        }
    }
}
