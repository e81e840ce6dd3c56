//! HTIF - Host/Target Interface
//!
//! A pair of 64-bit registers the guest uses to punch commands through to
//! the host: halt, console put/get character, and yield. Commands are
//! encoded in `tohost` as `device(8) | cmd(8) | payload(48)` and dispatch
//! happens only on the high-word 32-bit write, which the bus layer
//! preserves when splitting 64-bit stores.

use std::collections::VecDeque;
use std::io::{self, Write};

use tracing::warn;

use crate::access::StateAccess;
use crate::merkle::PAGE_SIZE;
use crate::state::MachineState;

// Register map (relative to the HTIF base)
pub const HTIF_TOHOST_REL_ADDR: u64 = 0x00;
pub const HTIF_FROMHOST_REL_ADDR: u64 = 0x08;
pub const HTIF_IHALT_REL_ADDR: u64 = 0x10;
pub const HTIF_ICONSOLE_REL_ADDR: u64 = 0x18;
pub const HTIF_IYIELD_REL_ADDR: u64 = 0x20;

// Devices
pub const DEV_HALT: u64 = 0;
pub const DEV_CONSOLE: u64 = 1;
pub const DEV_YIELD: u64 = 2;

// Commands
pub const HALT_CMD_HALT: u64 = 0;
pub const CONSOLE_CMD_GETCHAR: u64 = 0;
pub const CONSOLE_CMD_PUTCHAR: u64 = 1;
pub const YIELD_CMD_MANUAL: u64 = 0;
pub const YIELD_CMD_AUTOMATIC: u64 = 1;

/// Default command enables for a new machine.
pub const DEFAULT_IHALT: u64 = 1 << HALT_CMD_HALT;
pub const DEFAULT_ICONSOLE: u64 = (1 << CONSOLE_CMD_GETCHAR) | (1 << CONSOLE_CMD_PUTCHAR);
pub const DEFAULT_IYIELD: u64 = (1 << YIELD_CMD_MANUAL) | (1 << YIELD_CMD_AUTOMATIC);

pub fn dev_field(tohost: u64) -> u64 {
    tohost >> 56
}

pub fn cmd_field(tohost: u64) -> u64 {
    (tohost >> 48) & 0xFF
}

pub fn payload_field(tohost: u64) -> u64 {
    tohost & ((1 << 48) - 1)
}

pub fn build_fromhost(dev: u64, cmd: u64, payload: u64) -> u64 {
    (dev << 56) | (cmd << 48) | (payload & ((1 << 48) - 1))
}

/// 32-bit bus read. Only tohost/fromhost are bus-visible; the enable masks
/// read as zero, like any other hole.
pub fn mmio_read<A: StateAccess>(a: &mut A, offset: u64) -> Result<u32, A::Error> {
    let val = match offset {
        0x0 => a.read_htif_tohost()? as u32,
        0x4 => (a.read_htif_tohost()? >> 32) as u32,
        0x8 => a.read_htif_fromhost()? as u32,
        0xC => (a.read_htif_fromhost()? >> 32) as u32,
        _ => 0,
    };
    Ok(val)
}

/// 32-bit bus write. The low tohost half is just merged; the high half
/// triggers command handling.
pub fn mmio_write<A: StateAccess>(a: &mut A, offset: u64, val: u32) -> Result<(), A::Error> {
    match offset {
        0x0 => {
            let tohost = a.read_htif_tohost()?;
            a.write_htif_tohost((tohost & !0xFFFF_FFFF) | val as u64)?;
        }
        0x4 => {
            let tohost = a.read_htif_tohost()?;
            a.write_htif_tohost((tohost & 0xFFFF_FFFF) | ((val as u64) << 32))?;
            handle_cmd(a)?;
        }
        0x8 => {
            let fromhost = a.read_htif_fromhost()?;
            a.write_htif_fromhost((fromhost & !0xFFFF_FFFF) | val as u64)?;
        }
        0xC => {
            let fromhost = a.read_htif_fromhost()?;
            a.write_htif_fromhost((fromhost & 0xFFFF_FFFF) | ((val as u64) << 32))?;
        }
        _ => {}
    }
    Ok(())
}

fn handle_cmd<A: StateAccess>(a: &mut A) -> Result<(), A::Error> {
    let tohost = a.read_htif_tohost()?;
    let dev = dev_field(tohost);
    let cmd = cmd_field(tohost);
    let payload = payload_field(tohost);
    match dev {
        DEV_HALT if cmd == HALT_CMD_HALT => {
            let ihalt = a.read_htif_ihalt()?;
            if (ihalt >> cmd) & 1 != 0 && payload & 1 != 0 {
                a.set_iflags_h()?;
                a.or_brk_with_iflags_h();
            }
        }
        DEV_CONSOLE if cmd == CONSOLE_CMD_PUTCHAR => {
            let iconsole = a.read_htif_iconsole()?;
            if (iconsole >> cmd) & 1 != 0 {
                a.console_putchar(payload as u8);
                a.write_htif_tohost(0)?;
                a.write_htif_fromhost(build_fromhost(dev, cmd, 0))?;
            }
        }
        DEV_CONSOLE if cmd == CONSOLE_CMD_GETCHAR => {
            let iconsole = a.read_htif_iconsole()?;
            if (iconsole >> cmd) & 1 != 0 {
                // The host feeds the character through fromhost later.
                a.write_htif_tohost(0)?;
            }
        }
        DEV_YIELD => {
            let iyield = a.read_htif_iyield()?;
            if cmd < 64 && (iyield >> cmd) & 1 != 0 {
                // tohost keeps the command; the break predicate reads the
                // device and cmd fields from it and the host acknowledges
                // on resume.
                a.set_iflags_y()?;
                a.or_brk_with_iflags_y();
            }
        }
        _ => {
            warn!(tohost, dev, cmd, payload, "unsupported HTIF command");
        }
    }
    Ok(())
}

/// Materializes the HTIF register page for Merkle hashing.
pub fn peek(state: &MachineState, page_offset: u64, page: &mut [u8; PAGE_SIZE]) -> bool {
    if page_offset != 0 {
        return false;
    }
    page.fill(0);
    let mut put = |rel: u64, val: u64| {
        let at = rel as usize;
        page[at..at + 8].copy_from_slice(&val.to_le_bytes());
    };
    put(HTIF_TOHOST_REL_ADDR, state.htif.tohost);
    put(HTIF_FROMHOST_REL_ADDR, state.htif.fromhost);
    put(HTIF_IHALT_REL_ADDR, state.htif.ihalt);
    put(HTIF_ICONSOLE_REL_ADDR, state.htif.iconsole);
    put(HTIF_IYIELD_REL_ADDR, state.htif.iyield);
    true
}

/// Writes one guest character to the host's stdout.
pub fn host_putchar(ch: u8) {
    let mut out = io::stdout();
    let _ = out.write_all(&[ch]);
    let _ = out.flush();
}

/// Host side of the console device.
///
/// In interactive mode the controlling terminal is switched to raw,
/// non-blocking mode; the original settings are restored when the console
/// is dropped, however the machine goes away.
pub struct Console {
    buf: VecDeque<u8>,
    tty: Option<RawTty>,
}

impl Console {
    /// Console reading from the process stdin in raw mode.
    pub fn interactive() -> io::Result<Console> {
        Ok(Console { buf: VecDeque::new(), tty: Some(RawTty::acquire()?) })
    }

    /// Console fed from a fixed byte sequence; used by tests and batch runs.
    pub fn from_input(input: &[u8]) -> Console {
        Console { buf: input.iter().copied().collect(), tty: None }
    }

    /// Fetches the next input character if one is available. `idle` allows
    /// a short blocking wait so an idle CPU does not spin on the host.
    pub fn poll(&mut self, idle: bool) -> Option<u8> {
        if self.buf.is_empty() {
            if let Some(tty) = &self.tty {
                let timeout_us = if idle { 1000 } else { 0 };
                if tty.wait_readable(timeout_us) {
                    let mut chunk = [0u8; 256];
                    let n = tty.read(&mut chunk);
                    if n <= 0 {
                        // EOF on stdin reads as CTRL+D for the guest.
                        self.buf.push_back(4);
                    } else {
                        self.buf.extend(&chunk[..n as usize]);
                    }
                }
            }
        }
        self.buf.pop_front()
    }
}

/// Raw-mode terminal guard over stdin.
struct RawTty {
    orig_termios: libc::termios,
    orig_flags: libc::c_int,
}

impl RawTty {
    fn acquire() -> io::Result<RawTty> {
        unsafe {
            let mut orig: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut orig) != 0 {
                return Err(io::Error::last_os_error());
            }
            let orig_flags = libc::fcntl(libc::STDIN_FILENO, libc::F_GETFL);
            let mut raw = orig;
            raw.c_iflag &= !(libc::IGNBRK
                | libc::BRKINT
                | libc::PARMRK
                | libc::ISTRIP
                | libc::INLCR
                | libc::IGNCR
                | libc::ICRNL
                | libc::IXON);
            raw.c_oflag |= libc::OPOST;
            raw.c_lflag &= !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::IEXTEN | libc::ISIG);
            raw.c_cflag &= !(libc::CSIZE | libc::PARENB);
            raw.c_cflag |= libc::CS8;
            raw.c_cc[libc::VMIN] = 1;
            raw.c_cc[libc::VTIME] = 0;
            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) != 0 {
                return Err(io::Error::last_os_error());
            }
            libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, orig_flags | libc::O_NONBLOCK);
            Ok(RawTty { orig_termios: orig, orig_flags })
        }
    }

    fn wait_readable(&self, timeout_us: i64) -> bool {
        unsafe {
            let mut rfds: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut rfds);
            libc::FD_SET(libc::STDIN_FILENO, &mut rfds);
            let mut tv = libc::timeval { tv_sec: 0, tv_usec: timeout_us as libc::suseconds_t };
            libc::select(
                libc::STDIN_FILENO + 1,
                &mut rfds,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tv,
            ) > 0
        }
    }

    fn read(&self, buf: &mut [u8]) -> isize {
        unsafe { libc::read(libc::STDIN_FILENO, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) }
    }
}

impl Drop for RawTty {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.orig_termios);
            libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, self.orig_flags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::DirectAccess;
    use crate::state::MachineState;

    fn unerr<T>(r: Result<T, std::convert::Infallible>) -> T {
        match r {
            Ok(v) => v,
            Err(never) => match never {},
        }
    }

    fn machine_with_defaults() -> MachineState {
        let mut state = MachineState::new();
        state.htif.ihalt = DEFAULT_IHALT;
        state.htif.iconsole = DEFAULT_ICONSOLE;
        state.htif.iyield = DEFAULT_IYIELD;
        state
    }

    #[test]
    fn halt_command_sets_h() {
        let mut state = machine_with_defaults();
        let mut a = DirectAccess::new(&mut state);
        unerr(mmio_write(&mut a, 0x0, 1));
        assert!(!state.iflags.h, "low-word write must not dispatch");
        let mut a = DirectAccess::new(&mut state);
        unerr(mmio_write(&mut a, 0x4, 0));
        assert!(state.iflags.h);
        assert!(state.brk);
    }

    #[test]
    fn putchar_acknowledges() {
        let mut state = machine_with_defaults();
        let mut a = DirectAccess::new(&mut state);
        let cmd = build_fromhost(DEV_CONSOLE, CONSOLE_CMD_PUTCHAR, b'x' as u64);
        unerr(mmio_write(&mut a, 0x0, cmd as u32));
        unerr(mmio_write(&mut a, 0x4, (cmd >> 32) as u32));
        assert_eq!(state.htif.tohost, 0);
        assert_eq!(state.htif.fromhost, build_fromhost(DEV_CONSOLE, CONSOLE_CMD_PUTCHAR, 0));
    }

    #[test]
    fn ungated_command_is_ignored() {
        let mut state = machine_with_defaults();
        state.htif.ihalt = 0;
        let mut a = DirectAccess::new(&mut state);
        unerr(mmio_write(&mut a, 0x0, 1));
        unerr(mmio_write(&mut a, 0x4, 0));
        assert!(!state.iflags.h);
        assert_eq!(state.htif.tohost, 1);
    }

    #[test]
    fn yield_sets_y_and_breaks() {
        let mut state = machine_with_defaults();
        let mut a = DirectAccess::new(&mut state);
        let cmd = build_fromhost(DEV_YIELD, YIELD_CMD_MANUAL, 0);
        unerr(mmio_write(&mut a, 0x0, cmd as u32));
        unerr(mmio_write(&mut a, 0x4, (cmd >> 32) as u32));
        assert!(state.iflags.y);
        assert_eq!(state.htif.tohost, cmd, "tohost keeps the yield command");
        assert!(state.brk);
    }

    #[test]
    fn fixed_console_feeds_bytes() {
        let mut console = Console::from_input(b"ab");
        assert_eq!(console.poll(false), Some(b'a'));
        assert_eq!(console.poll(true), Some(b'b'));
        assert_eq!(console.poll(false), None);
    }
}
