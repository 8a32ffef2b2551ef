use std::io::{Read, Write};

use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, NativePtySystem, PtySystem};

use super::{PtyError, PtyFactory, PtyHandle, PtySize};
use crate::cmd::CommandSpec;

fn io_err(e: impl ToString) -> PtyError {
    PtyError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

fn to_native(size: PtySize) -> portable_pty::PtySize {
    portable_pty::PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// PTY factory backed by the platform PTY (`portable-pty`).
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyFactory;

impl PtyFactory for NativePtyFactory {
    fn start(&self, spec: &CommandSpec, size: PtySize) -> Result<Box<dyn PtyHandle>, PtyError> {
        tracing::debug!("Creating PTY: {} cwd={:?}", spec, spec.cwd);

        let pty_system = NativePtySystem::default();
        let pty_pair = pty_system
            .openpty(to_native(size))
            .map_err(|e| PtyError::CreateError(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(ref dir) = spec.cwd {
            cmd.cwd(dir);
        }

        let child = pty_pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnError(e.to_string()))?;

        let writer = pty_pair.master.take_writer().map_err(io_err)?;

        // The slave end belongs to the child now
        drop(pty_pair.slave);

        Ok(Box::new(NativePtyHandle {
            master: Some(pty_pair.master),
            writer: Some(writer),
            child: Some(child),
        }))
    }
}

pub struct NativePtyHandle {
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
}

impl PtyHandle for NativePtyHandle {
    fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        let writer = self.writer.as_mut().ok_or(PtyError::Closed)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn resize(&mut self, size: PtySize) -> Result<(), PtyError> {
        let master = self.master.as_ref().ok_or(PtyError::Closed)?;
        master.resize(to_native(size)).map_err(io_err)
    }

    fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        let master = self.master.as_ref().ok_or(PtyError::Closed)?;
        master.try_clone_reader().map_err(io_err)
    }

    fn close(&mut self) -> Result<(), PtyError> {
        self.writer.take();

        let mut result = Ok(());
        if let Some(mut child) = self.child.take() {
            // The attach client may already have exited on its own
            if let Ok(None) = child.try_wait() {
                if let Err(e) = child.kill() {
                    result = Err(io_err(e));
                }
                let _ = child.wait();
            }
        }
        self.master.take();
        result
    }
}

impl Drop for NativePtyHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
