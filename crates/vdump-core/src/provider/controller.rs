//! Parent-side controller for the block-provider child process.
//!
//! The provider library runs in a forked child and is driven over a pipe
//! pair carrying framed messages: a textual command token, an optional
//! payload, then an `OK` or `EXCEPTION` reply with an optional result
//! frame. Startup performs a `CHECK`/`OK`/`ACK` handshake so a half-dead
//! child is detected before any command is issued.
//!
//! `reset` tears the child down and forks a fresh one; the caller must
//! pause every archive worker around any call that forks, so no thread is
//! alive when the address space is duplicated.

use std::fs::File;
use std::io::Cursor;
use std::os::unix::io::FromRawFd;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::provider::frame::FrameSocket;
use crate::provider::{BlockProvider, DiskInfo, ProviderFactory};
use crate::record::DumpHeader;
use crate::serialize::{self, StringMap};
use vdump_types::error::{Result, VdumpError};

/// The provider operations orchestrators use, plus `reset`. The controller
/// is the production implementation; tests substitute in-process fakes.
pub trait ProviderSession {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn read_block(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_block(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
    fn read_info(&mut self) -> Result<DiskInfo>;
    fn read_metadata(&mut self) -> Result<StringMap>;
    fn write_metadata(&mut self, metadata: &StringMap) -> Result<()>;
    fn create_image(&mut self, header: &DumpHeader) -> Result<()>;
    fn shrink(&mut self) -> Result<()>;
    fn transport_mode(&mut self) -> Result<String>;
    /// Stop the child and fork a fresh one with new open flags.
    fn reset(&mut self, read_only: bool, use_san: bool) -> Result<()>;
}

struct ChildLink {
    pid: libc::pid_t,
    sock: FrameSocket<File, File>,
}

pub struct ProviderController {
    factory: Arc<dyn ProviderFactory>,
    block_size: u64,
    read_only: bool,
    use_san: bool,
    link: Option<ChildLink>,
}

fn make_pipe() -> Result<(libc::c_int, libc::c_int)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds points at two writable ints.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(VdumpError::Provider(format!(
            "pipe creation failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok((fds[0], fds[1]))
}

fn close_fd(fd: libc::c_int) {
    // SAFETY: fd came from pipe() and is closed exactly once.
    unsafe {
        libc::close(fd);
    }
}

fn reap(pid: libc::pid_t) {
    let mut status: libc::c_int = 0;
    // SAFETY: plain waitpid on our own child.
    unsafe {
        libc::waitpid(pid, &mut status, 0);
    }
}

impl ProviderController {
    pub fn new(
        factory: Arc<dyn ProviderFactory>,
        block_size: u64,
        read_only: bool,
        use_san: bool,
    ) -> Self {
        ProviderController {
            factory,
            block_size,
            read_only,
            use_san,
            link: None,
        }
    }

    /// Fork the child and complete the handshake. The caller must ensure no
    /// worker threads are running.
    pub fn start(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }
        let (p2c_read, p2c_write) = make_pipe()?;
        let (c2p_read, c2p_write) = make_pipe()?;

        // SAFETY: the fork discipline (no live worker threads) is enforced
        // by callers pausing all stream managers first.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            for fd in [p2c_read, p2c_write, c2p_read, c2p_write] {
                close_fd(fd);
            }
            return Err(VdumpError::Provider(format!(
                "fork failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        if pid == 0 {
            // Child: never returns.
            close_fd(p2c_write);
            close_fd(c2p_read);
            // SAFETY: the child owns these fds exclusively from here on.
            let reader = unsafe { File::from_raw_fd(p2c_read) };
            let writer = unsafe { File::from_raw_fd(c2p_write) };
            let code = child_serve(
                self.factory.as_ref(),
                self.read_only,
                self.use_san,
                self.block_size,
                FrameSocket::new(reader, writer),
            );
            // SAFETY: _exit skips atexit handlers; the parent's state must
            // not be torn down from the child.
            unsafe { libc::_exit(code) }
        }

        // Parent.
        close_fd(p2c_read);
        close_fd(c2p_write);
        // SAFETY: the parent owns these fds exclusively from here on.
        let reader = unsafe { File::from_raw_fd(c2p_read) };
        let writer = unsafe { File::from_raw_fd(p2c_write) };
        let mut sock = FrameSocket::new(reader, writer);

        let handshake = (|| -> Result<()> {
            sock.send_msg("CHECK")?;
            let reply = sock.recv_msg()?;
            if reply != "OK" {
                return Err(VdumpError::Provider(format!(
                    "provider child handshake failed (got '{reply}')"
                )));
            }
            sock.send_msg("ACK")
        })();
        if let Err(e) = handshake {
            // The child may still be waiting on the pipe; do not block in
            // waitpid on a process that will never exit by itself.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            reap(pid);
            return Err(e);
        }

        debug!(pid, "provider child started");
        self.link = Some(ChildLink { pid, sock });
        Ok(())
    }

    /// Ask the child to exit and reap it. Escalates to SIGTERM when the
    /// child no longer answers.
    pub fn stop(&mut self) {
        if let Some(mut link) = self.link.take() {
            let polite = link
                .sock
                .send_msg("EXIT")
                .and_then(|_| link.sock.recv_msg());
            match polite {
                Ok(reply) if reply == "OK" => {}
                _ => {
                    warn!(pid = link.pid, "provider child not answering, sending SIGTERM");
                    // SAFETY: signalling our own child.
                    unsafe {
                        libc::kill(link.pid, libc::SIGTERM);
                    }
                }
            }
            reap(link.pid);
            debug!(pid = link.pid, "provider child reaped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.link.is_some()
    }

    fn link_mut(&mut self) -> Result<&mut ChildLink> {
        self.link
            .as_mut()
            .ok_or_else(|| VdumpError::Provider("provider controller is not started".into()))
    }

    /// Send a command token and expect a bare `OK`.
    fn simple_command(&mut self, token: &str) -> Result<()> {
        let link = self.link_mut()?;
        link.sock.send_msg(token)?;
        expect_ok(&mut link.sock, token)
    }
}

fn expect_ok(sock: &mut FrameSocket<File, File>, what: &str) -> Result<()> {
    match sock.recv_msg()?.as_str() {
        "OK" => Ok(()),
        "EXCEPTION" => Err(VdumpError::Provider(format!(
            "{what} failed in the provider child"
        ))),
        other => Err(VdumpError::Provider(format!(
            "unexpected reply '{other}' to {what}"
        ))),
    }
}

impl ProviderSession for ProviderController {
    fn open(&mut self) -> Result<()> {
        self.simple_command("open")
    }

    fn close(&mut self) -> Result<()> {
        self.simple_command("close")
    }

    fn read_block(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let link = self.link_mut()?;
        link.sock.send_msg("readBlock")?;
        link.sock.send_msg(&offset.to_string())?;
        expect_ok(&mut link.sock, "readBlock")?;
        let payload = link.sock.recv_buf()?;
        if payload.len() != buf.len() {
            return Err(VdumpError::Provider(format!(
                "readBlock returned {} bytes, expected {}",
                payload.len(),
                buf.len()
            )));
        }
        buf.copy_from_slice(&payload);
        Ok(())
    }

    fn write_block(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let link = self.link_mut()?;
        link.sock.send_msg("writeBlock")?;
        link.sock.send_msg(&offset.to_string())?;
        link.sock.send_buf(buf)?;
        expect_ok(&mut link.sock, "writeBlock")
    }

    fn read_info(&mut self) -> Result<DiskInfo> {
        let link = self.link_mut()?;
        link.sock.send_msg("readVmdkInfo")?;
        expect_ok(&mut link.sock, "readVmdkInfo")?;
        let payload = link.sock.recv_buf()?;
        DiskInfo::read_from(&mut Cursor::new(payload))
    }

    fn read_metadata(&mut self) -> Result<StringMap> {
        let link = self.link_mut()?;
        link.sock.send_msg("readMetadata")?;
        expect_ok(&mut link.sock, "readMetadata")?;
        let payload = link.sock.recv_buf()?;
        serialize::get_map(&mut Cursor::new(payload))
    }

    fn write_metadata(&mut self, metadata: &StringMap) -> Result<()> {
        let mut payload = Vec::new();
        serialize::put_map(&mut payload, metadata)?;
        let link = self.link_mut()?;
        link.sock.send_msg("writeMetadata")?;
        link.sock.send_buf(&payload)?;
        expect_ok(&mut link.sock, "writeMetadata")
    }

    fn create_image(&mut self, header: &DumpHeader) -> Result<()> {
        let mut payload = Vec::new();
        header.write_to(&mut payload)?;
        let link = self.link_mut()?;
        link.sock.send_msg("createVmdkFile")?;
        link.sock.send_buf(&payload)?;
        expect_ok(&mut link.sock, "createVmdkFile")
    }

    fn shrink(&mut self) -> Result<()> {
        self.simple_command("shrinkVmdk")
    }

    fn transport_mode(&mut self) -> Result<String> {
        let link = self.link_mut()?;
        link.sock.send_msg("getTransportMode")?;
        link.sock.recv_msg()
    }

    fn reset(&mut self, read_only: bool, use_san: bool) -> Result<()> {
        debug!(read_only, use_san, "resetting provider child");
        self.stop();
        self.read_only = read_only;
        self.use_san = use_san;
        self.start()
    }
}

impl Drop for ProviderController {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Child side
// ---------------------------------------------------------------------------

extern "C" fn child_signal_handler(_sig: libc::c_int) {
    // The provider's resources are process-scoped; exiting releases them.
    // Nothing here may allocate or lock.
    unsafe { libc::_exit(1) }
}

/// Command loop of the forked child. Returns the process exit code.
fn child_serve(
    factory: &dyn ProviderFactory,
    read_only: bool,
    use_san: bool,
    block_size: u64,
    mut sock: FrameSocket<File, File>,
) -> i32 {
    // SAFETY: handler only calls _exit.
    unsafe {
        libc::signal(
            libc::SIGTERM,
            child_signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            child_signal_handler as *const () as libc::sighandler_t,
        );
    }

    // The provider library initializes before the handshake, so a broken
    // provider surfaces as a handshake failure in the parent.
    let mut provider = match factory.build(read_only, use_san) {
        Ok(p) => p,
        Err(e) => {
            warn!("provider construction failed in child: {e}");
            return 2;
        }
    };

    let handshake = (|| -> Result<()> {
        let check = sock.recv_msg()?;
        if check != "CHECK" {
            return Err(VdumpError::Provider(format!("expected CHECK, got '{check}'")));
        }
        sock.send_msg("OK")?;
        let ack = sock.recv_msg()?;
        if ack != "ACK" {
            return Err(VdumpError::Provider(format!("expected ACK, got '{ack}'")));
        }
        Ok(())
    })();
    if handshake.is_err() {
        return 3;
    }

    let ctx = ChildContext {
        read_only,
        block_size,
    };
    loop {
        let token = match sock.recv_msg() {
            Ok(token) => token,
            // Parent gone; nothing left to serve.
            Err(_) => return 4,
        };
        if token == "EXIT" {
            let _ = sock.send_msg("OK");
            break;
        }
        if dispatch(provider.as_mut(), &ctx, &token, &mut sock).is_err() {
            // Pipe-level failure; provider-level failures already replied
            // EXCEPTION and continue.
            return 5;
        }
    }

    let _ = provider.close();
    0
}

struct ChildContext {
    read_only: bool,
    block_size: u64,
}

/// Run one command against the provider and reply. `Err` only for pipe
/// failures; provider failures reply `EXCEPTION` and return `Ok`.
fn dispatch(
    provider: &mut dyn BlockProvider,
    ctx: &ChildContext,
    token: &str,
    sock: &mut FrameSocket<File, File>,
) -> Result<()> {
    match token {
        "open" => reply_status(sock, provider.open(ctx.read_only)),
        "close" => reply_status(sock, provider.close()),
        "shrinkVmdk" => reply_status(sock, provider.shrink()),
        "getTransportMode" => sock.send_msg(&provider.transport_mode()),
        "readBlock" => {
            let offset = match parse_offset(sock)? {
                Some(offset) => offset,
                None => return sock.send_msg("EXCEPTION"),
            };
            let mut buf = vec![0u8; ctx.block_size as usize];
            match provider.read_block(offset, &mut buf) {
                Ok(()) => {
                    sock.send_msg("OK")?;
                    sock.send_buf(&buf)
                }
                Err(e) => {
                    warn!("readBlock({offset}) failed: {e}");
                    sock.send_msg("EXCEPTION")
                }
            }
        }
        "writeBlock" => {
            let offset = parse_offset(sock)?;
            let buf = sock.recv_buf()?;
            match offset {
                Some(offset) if buf.len() as u64 == ctx.block_size => {
                    reply_status(sock, provider.write_block(offset, &buf))
                }
                _ => sock.send_msg("EXCEPTION"),
            }
        }
        "readVmdkInfo" => match provider.read_info() {
            Ok(info) => {
                let mut payload = Vec::new();
                info.write_to(&mut payload)?;
                sock.send_msg("OK")?;
                sock.send_buf(&payload)
            }
            Err(e) => {
                warn!("readVmdkInfo failed: {e}");
                sock.send_msg("EXCEPTION")
            }
        },
        "readMetadata" => match provider.read_metadata() {
            Ok(map) => {
                let mut payload = Vec::new();
                serialize::put_map(&mut payload, &map)?;
                sock.send_msg("OK")?;
                sock.send_buf(&payload)
            }
            Err(e) => {
                warn!("readMetadata failed: {e}");
                sock.send_msg("EXCEPTION")
            }
        },
        "writeMetadata" => {
            let payload = sock.recv_buf()?;
            match serialize::get_map(&mut Cursor::new(payload)) {
                Ok(map) => reply_status(sock, provider.write_metadata(&map)),
                Err(_) => sock.send_msg("EXCEPTION"),
            }
        }
        "createVmdkFile" => {
            let payload = sock.recv_buf()?;
            match DumpHeader::read_from(&mut Cursor::new(payload)) {
                Ok(header) => reply_status(sock, provider.create_image(&header)),
                Err(_) => sock.send_msg("EXCEPTION"),
            }
        }
        other => {
            warn!("unknown provider command '{other}'");
            sock.send_msg("EXCEPTION")
        }
    }
}

fn reply_status(sock: &mut FrameSocket<File, File>, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => sock.send_msg("OK"),
        Err(e) => {
            warn!("provider command failed: {e}");
            sock.send_msg("EXCEPTION")
        }
    }
}

/// Offset argument frame; `None` when unparsable (protocol stays in sync,
/// command fails).
fn parse_offset(sock: &mut FrameSocket<File, File>) -> Result<Option<u64>> {
    let msg = sock.recv_msg()?;
    Ok(msg.parse().ok())
}
