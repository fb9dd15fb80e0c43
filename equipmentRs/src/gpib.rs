//! This module provides the transport for GPIB devices and boards, using the NI-488.2 or
//! linux-gpib shared library.
//!
//! The library is found from the `library` option, then the `GPIB_LIBRARY` environment variable,
//! then the default library names of the platform. Every library function returns the status word
//! `ibsta`; a set `ERR` bit is turned into [`EquipmentError::Gpib`] and a set `TIMO` bit into a
//! timeout.

use std::{
    any::Any,
    ffi::{CString, c_char, c_int, c_long, c_short},
    time::Duration,
};

use libloading::{Library, Symbol};

use crate::{
    Address, AddressFields, Chunk, ConnectOptions, EquipmentError, GpibTarget, Transport,
};

// status bits
const ERR: c_int = 0x8000;
const TIMO: c_int = 0x4000;
const END: c_int = 0x2000;

// ibask and ibconfig options
const IBC_TMO: c_int = 0x3;
const IBC_SRE: c_int = 0xB;
const IBC_EOS_RD: c_int = 0xC;
const IBC_EOS_CHAR: c_int = 0xF;
const IBA_SC: c_int = 0xA;
const IBA_PAD: c_int = 0x1;

// iberr values that are followed by an errno in ibcntl
const EDVR: c_int = 0;
const EFSO: c_int = 12;

/// No secondary address.
const NO_SEC_ADDR: c_int = 0;

const READ_CHUNK: usize = 20 * 1024;

/// The timeout values that the `ibtmo` codes stand for, code 0 disables the timeout.
const TIMEOUTS: [f64; 18] = [
    0.0, 10e-6, 30e-6, 100e-6, 300e-6, 1e-3, 3e-3, 10e-3, 30e-3, 100e-3, 300e-3, 1.0, 3.0, 10.0,
    30.0, 100.0, 300.0, 1000.0,
];

/// Convert a timeout into the code of the nearest library timeout that is not shorter.
fn timeout_code(timeout: Option<Duration>) -> c_int {
    let Some(timeout) = timeout else {
        return 0;
    };
    let seconds = timeout.as_secs_f64();
    if seconds <= 0.0 {
        return 0;
    }
    if let Some(index) = TIMEOUTS.iter().position(|&t| t == seconds) {
        return index as c_int;
    }
    let index = TIMEOUTS.partition_point(|&t| t <= seconds);
    index.min(TIMEOUTS.len() - 1) as c_int
}

/// Description of an `iberr` value.
pub(crate) fn error_message(iberr: c_int) -> &'static str {
    match iberr {
        0 => "A system call has failed",
        1 => "Your interface board needs to be controller-in-charge, but is not",
        2 => "You have attempted to write data or command bytes, but there are no listeners currently addressed",
        3 => "The interface board has failed to address itself properly before starting an io operation",
        4 => "One or more arguments to the function call were invalid",
        5 => "The interface board needs to be system controller, but is not",
        6 => "A read or write of data bytes has been aborted, possibly due to a timeout or reception of a device clear command",
        7 => "The GPIB interface board does not exist, its driver is not loaded, or it is in use by another process",
        8 => "Not used (DMA error), included for compatibility purposes",
        10 => "Function call can not proceed due to an asynchronous IO operation in progress",
        11 => "Incapable of executing function call, due the GPIB board lacking the capability, or the capability being disabled in software",
        12 => "File system error",
        14 => "An attempt to write command bytes to the bus has timed out",
        15 => "One or more serial poll status bytes have been lost",
        16 => "The serial poll request service line is stuck on",
        20 => "This error can be returned by ibevent(), FindLstn(), or FindRQS()",
        21 => "Address or board is locked",
        22 => "The ibnotify Callback failed to rearm",
        23 => "The input handle is invalid for this operation",
        26 => "Wait already in progress on input handle",
        27 => "The event notification was cancelled due to a reset of the interface",
        28 => "The system or board has lost power or gone to standby",
        -535560148 => "The board number is within the range of allowed board numbers, but it has not been assigned to a GPIB interface",
        -535560155 => "The board number is not within the range of allowed board numbers",
        -535560139 => "The device name is not listed in the logical device templates",
        -519569280 | -519569279 => "The removable interface was removed while the software was communicating with it",
        -536215481 => "The driver encountered an access violation when attempting to access an object supplied by the user",
        -519700363 => "The driver is unable to communicate with a GPIB-ENET/100 during an ibfind or ibdev call",
        -519700360 => "The network link is broken between the host and the GPIB-ENET/100 interface",
        _ => "Unknown error",
    }
}

#[cfg(windows)]
const DEFAULT_LIBRARIES: &[&str] = &["ni4882.dll", "gpib-32.dll"];
#[cfg(target_os = "linux")]
const DEFAULT_LIBRARIES: &[&str] = &[
    "libgpib.so.0",
    "libgpib.so",
    "/usr/local/lib/libgpib.so.0",
    "gpib-32.so",
];
#[cfg(target_os = "macos")]
const DEFAULT_LIBRARIES: &[&str] = &[
    "/Library/Frameworks/NI4882.framework/NI4882",
    "macosx_gpib_lib_1.0.3a.dylib",
];
#[cfg(not(any(windows, target_os = "linux", target_os = "macos")))]
const DEFAULT_LIBRARIES: &[&str] = &[];

#[cfg(windows)]
const IBFIND: &[u8] = b"ibfindA\0";
#[cfg(not(windows))]
const IBFIND: &[u8] = b"ibfind\0";

type HandleFn = unsafe extern "system" fn(c_int) -> c_int;
type HandleIntFn = unsafe extern "system" fn(c_int, c_int) -> c_int;
type HandleIntIntFn = unsafe extern "system" fn(c_int, c_int, c_int) -> c_int;
type AskFn = unsafe extern "system" fn(c_int, c_int, *mut c_int) -> c_int;
type IbdevFn = unsafe extern "system" fn(c_int, c_int, c_int, c_int, c_int, c_int) -> c_int;
type IbfindFn = unsafe extern "system" fn(*const c_char) -> c_int;
type ReadFn = unsafe extern "system" fn(c_int, *mut u8, c_long) -> c_int;
type WriteFn = unsafe extern "system" fn(c_int, *const u8, c_long) -> c_int;
type RspFn = unsafe extern "system" fn(c_int, *mut c_char) -> c_int;
type LnFn = unsafe extern "system" fn(c_int, c_int, c_int, *mut c_short) -> c_int;
type ThreadFn = unsafe extern "system" fn() -> c_int;
type ThreadLongFn = unsafe extern "system" fn() -> c_long;

/// A loaded GPIB library.
#[derive(Debug)]
struct GpibLibrary {
    library: Library,
    path: String,
}

impl GpibLibrary {
    fn load(path: Option<&str>) -> Result<Self, EquipmentError> {
        let env = std::env::var("GPIB_LIBRARY").ok();
        let candidates: Vec<String> = match path.map(str::to_string).or(env) {
            Some(path) => vec![path],
            None => DEFAULT_LIBRARIES.iter().map(|s| s.to_string()).collect(),
        };
        let mut last_error = None;
        for candidate in &candidates {
            // SAFETY: loading a GPIB library runs its initialisers, which have no preconditions.
            match unsafe { Library::new(candidate) } {
                Ok(library) => {
                    log::debug!("Loaded GPIB library {candidate}");
                    return Ok(GpibLibrary {
                        library,
                        path: candidate.clone(),
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) => Err(EquipmentError::Library(e)),
            None => Err(EquipmentError::InvalidArgument(
                "There is no default GPIB library for this platform, set the GPIB_LIBRARY \
                 environment variable"
                    .to_string(),
            )),
        }
    }

    fn symbol<T>(&self, name: &[u8]) -> Result<Symbol<'_, T>, EquipmentError> {
        // SAFETY: every `T` used in this module matches the signature of the named function.
        Ok(unsafe { self.library.get::<T>(name)? })
    }

    fn iberr(&self) -> c_int {
        match self.symbol::<ThreadFn>(b"ThreadIberr\0") {
            // SAFETY: ThreadIberr takes no arguments.
            Ok(f) => unsafe { f() },
            Err(_) => -1,
        }
    }

    fn ibcntl(&self) -> Result<usize, EquipmentError> {
        let count = match self.symbol::<ThreadLongFn>(b"ThreadIbcntl\0") {
            // SAFETY: ThreadIbcntl takes no arguments.
            Ok(f) => unsafe { f() },
            Err(_) => {
                let f = self.symbol::<ThreadFn>(b"ThreadIbcnt\0")?;
                // SAFETY: ThreadIbcnt takes no arguments.
                c_long::from(unsafe { f() })
            }
        };
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn ibsta(&self) -> Result<c_int, EquipmentError> {
        let f = self.symbol::<ThreadFn>(b"ThreadIbsta\0")?;
        // SAFETY: ThreadIbsta takes no arguments.
        Ok(unsafe { f() })
    }

    /// Turn the status word of `function` into an error if the `ERR` or `TIMO` bit is set.
    fn check(
        &self,
        function: &'static str,
        ibsta: c_int,
        timeout: Option<Duration>,
    ) -> Result<c_int, EquipmentError> {
        log::debug!("gpib.{function} -> 0x{ibsta:04x}");
        if ibsta & TIMO != 0 {
            return Err(EquipmentError::Timeout {
                timeout: timeout.unwrap_or_default(),
                partial: Vec::new(),
            });
        }
        if ibsta & ERR != 0 {
            let iberr = self.iberr();
            if iberr == EDVR || iberr == EFSO {
                // ibcntl holds the errno
                let errno = i32::try_from(self.ibcntl().unwrap_or(0)).unwrap_or(0);
                log::debug!(
                    "gpib.{function} errno {errno}: {}",
                    std::io::Error::from_raw_os_error(errno)
                );
            }
            return Err(EquipmentError::Gpib {
                function,
                ibsta,
                iberr,
                message: error_message(iberr),
            });
        }
        Ok(ibsta)
    }
}

/// A GPIB device or board.
#[derive(Debug)]
pub struct GpibTransport {
    lib: GpibLibrary,
    handle: c_int,
    own: bool,
    is_board: bool,
    timeout_code: Option<c_int>,
}

impl GpibTransport {
    /// Load the library and acquire a handle for a `GPIB` address.
    ///
    /// A device address uses `ibdev`, a name uses `ibfind` and `INTFC` uses the board itself.
    /// Secondary addresses below 96 have 96 (0x60) added.
    pub fn open(address: &Address, options: &ConnectOptions) -> Result<Self, EquipmentError> {
        let AddressFields::Gpib(target) = address.fields() else {
            return Err(EquipmentError::connection(address, "not a GPIB address"));
        };
        let lib = GpibLibrary::load(options.gpib.library.as_deref())
            .map_err(|e| EquipmentError::connection(address, e))?;
        let board = c_int::try_from(address.board()).unwrap_or(c_int::MAX);

        let (handle, own) = match target {
            GpibTarget::Device { pad, sad } => {
                let sad = match sad {
                    Some(sad) if *sad < 0x60 => c_int::from(*sad) + 0x60,
                    Some(sad) => c_int::from(*sad),
                    None => NO_SEC_ADDR,
                };
                let ibdev = lib.symbol::<IbdevFn>(b"ibdev\0")?;
                let args = (
                    board,
                    c_int::from(*pad),
                    sad,
                    timeout_code(options.timeout),
                    c_int::from(options.gpib.send_eoi),
                    c_int::from(options.gpib.eos_mode),
                );
                // SAFETY: ibdev only takes integers.
                let handle = unsafe { ibdev(args.0, args.1, args.2, args.3, args.4, args.5) };
                log::debug!("gpib.ibdev{args:?} -> {handle}");
                (handle, true)
            }
            GpibTarget::Named(name) => {
                let ibfind = lib.symbol::<IbfindFn>(IBFIND)?;
                let c_name = CString::new(name.as_str()).map_err(|_| {
                    EquipmentError::connection(address, "the GPIB name contains a NUL byte")
                })?;
                // SAFETY: `c_name` is a valid NUL terminated string that outlives the call.
                let handle = unsafe { ibfind(c_name.as_ptr()) };
                log::debug!("gpib.ibfind({name:?}) -> {handle}");
                (handle, true)
            }
            GpibTarget::Interface => (board, false),
        };
        if handle < 0 {
            return Err(EquipmentError::connection(
                address,
                format!("cannot acquire a GPIB handle ({})", error_message(lib.iberr())),
            ));
        }

        let mut transport = GpibTransport {
            lib,
            handle,
            own,
            is_board: false,
            timeout_code: None,
        };
        transport.is_board = transport.ask(IBA_SC).map(|v| v != 0).unwrap_or(false);
        if !transport.is_board {
            transport.set_timeout(options.timeout)?;
        }
        let read_termination = options.read_termination_or(b"");
        if let Some(&last) = read_termination.last() {
            transport.config(IBC_EOS_RD, 1)?;
            transport.config(IBC_EOS_CHAR, c_int::from(last))?;
        }
        Ok(transport)
    }

    /// Scan all boards for listeners and return their addresses.
    ///
    /// # Arguments
    /// * `library` - Path to the GPIB library, see [`crate::GpibOptions::library`].
    /// * `include_sad` - Also scan the secondary addresses of each primary address.
    pub fn find_listeners(
        library: Option<&str>,
        include_sad: bool,
    ) -> Result<Vec<String>, EquipmentError> {
        let lib = GpibLibrary::load(library)?;
        let ibask = lib.symbol::<AskFn>(b"ibask\0")?;
        let ibdev = lib.symbol::<IbdevFn>(b"ibdev\0")?;
        let ibln = lib.symbol::<LnFn>(b"ibln\0")?;
        let ibonl = lib.symbol::<HandleIntFn>(b"ibonl\0")?;
        let mut found = Vec::new();
        for board in 0..16 {
            let mut board_pad: c_int = 0;
            // SAFETY: `board_pad` is a valid pointer for the duration of the call.
            if unsafe { ibask(board, IBA_PAD, &mut board_pad) } & ERR != 0 {
                continue;
            }
            // SAFETY: ibdev only takes integers, 8 is the 30 ms timeout code.
            let handle = unsafe { ibdev(board, board_pad, 0, 8, 1, 0) };
            if handle < 0 {
                continue;
            }
            let listening = |pad: c_int, sad: c_int| {
                let mut exists: c_short = 0;
                // SAFETY: `exists` is a valid pointer for the duration of the call.
                let ibsta = unsafe { ibln(board, pad, sad, &mut exists) };
                ibsta & ERR == 0 && exists != 0
            };
            for pad in 0..=30 {
                if pad == board_pad {
                    continue;
                }
                if listening(pad, 0) {
                    found.push(format!("GPIB{board}::{pad}::INSTR"));
                }
                if include_sad {
                    for sad in 96..=126 {
                        if listening(pad, sad) {
                            found.push(format!("GPIB{board}::{pad}::{sad}::INSTR"));
                        }
                    }
                }
            }
            // SAFETY: the handle was returned by ibdev.
            unsafe { ibonl(handle, 0) };
        }
        log::debug!("Found {} GPIB listener(s) using {}", found.len(), lib.path);
        Ok(found)
    }

    /// The board or device descriptor.
    pub fn handle(&self) -> c_int {
        self.handle
    }

    /// Whether the handle belongs to a board that is the system controller.
    pub fn is_board(&self) -> bool {
        self.is_board
    }

    /// Set the I/O timeout, rounded up to the next timeout the library supports.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), EquipmentError> {
        if self.is_board {
            return Err(EquipmentError::InvalidArgument(
                "Cannot set a timeout for a GPIB board".to_string(),
            ));
        }
        let code = timeout_code(timeout);
        if self.timeout_code != Some(code) {
            self.config(IBC_TMO, code)?;
            self.timeout_code = Some(code);
        }
        Ok(())
    }

    fn call(&self, function: &'static str, name: &[u8]) -> Result<c_int, EquipmentError> {
        let f = self.lib.symbol::<HandleFn>(name)?;
        // SAFETY: the function only takes the handle.
        let ibsta = unsafe { f(self.handle) };
        self.lib.check(function, ibsta, None)
    }

    /// `ibask`: get a configuration setting.
    pub fn ask(&self, option: c_int) -> Result<c_int, EquipmentError> {
        let f = self.lib.symbol::<AskFn>(b"ibask\0")?;
        let mut value: c_int = 0;
        // SAFETY: `value` is a valid pointer for the duration of the call.
        let ibsta = unsafe { f(self.handle, option, &mut value) };
        self.lib.check("ibask", ibsta, None)?;
        Ok(value)
    }

    /// `ibconfig`: change a configuration setting.
    pub fn config(&self, option: c_int, value: c_int) -> Result<c_int, EquipmentError> {
        let f = self.lib.symbol::<HandleIntIntFn>(b"ibconfig\0")?;
        // SAFETY: ibconfig only takes integers.
        let ibsta = unsafe { f(self.handle, option, value) };
        self.lib.check("ibconfig", ibsta, None)
    }

    /// `ibcmd`: write command bytes to the bus.
    pub fn command(&self, data: &[u8]) -> Result<c_int, EquipmentError> {
        let f = self.lib.symbol::<WriteFn>(b"ibcmd\0")?;
        // SAFETY: `data` is valid for `data.len()` bytes.
        let ibsta = unsafe { f(self.handle, data.as_ptr(), data.len() as c_long) };
        self.lib.check("ibcmd", ibsta, None)
    }

    /// `ibln`: whether a listener is present at the address.
    pub fn listener(&self, pad: u8, sad: u8) -> Result<bool, EquipmentError> {
        let f = self.lib.symbol::<LnFn>(b"ibln\0")?;
        let mut exists: c_short = 0;
        // SAFETY: `exists` is a valid pointer for the duration of the call.
        let ibsta = unsafe { f(self.handle, c_int::from(pad), c_int::from(sad), &mut exists) };
        self.lib.check("ibln", ibsta, None)?;
        Ok(exists != 0)
    }

    /// `ibsre`: assert (or release) the remote enable line. The board must be the system
    /// controller.
    pub fn remote_enable(&self, state: bool) -> Result<c_int, EquipmentError> {
        self.config(IBC_SRE, c_int::from(state))
    }

    /// `ibrsp`: serial poll the device.
    pub fn serial_poll(&self) -> Result<u8, EquipmentError> {
        let f = self.lib.symbol::<RspFn>(b"ibrsp\0")?;
        let mut status: c_char = 0;
        // SAFETY: `status` is a valid pointer for the duration of the call.
        let ibsta = unsafe { f(self.handle, &mut status) };
        self.lib.check("ibrsp", ibsta, None)?;
        Ok(status as u8)
    }

    /// `ibwait`: wait for any of the events in `mask`, returns the status word.
    pub fn wait(&self, mask: c_int) -> Result<c_int, EquipmentError> {
        let f = self.lib.symbol::<HandleIntFn>(b"ibwait\0")?;
        // SAFETY: ibwait only takes integers.
        let ibsta = unsafe { f(self.handle, mask) };
        self.lib.check("ibwait", ibsta, None)
    }

    /// `ibonl`: take the descriptor offline (`false`) or reset its settings (`true`).
    pub fn online(&self, state: bool) -> Result<c_int, EquipmentError> {
        let f = self.lib.symbol::<HandleIntFn>(b"ibonl\0")?;
        // SAFETY: ibonl only takes integers.
        let ibsta = unsafe { f(self.handle, c_int::from(state)) };
        self.lib.check("ibonl", ibsta, None)
    }

    /// The status word of the most recent call of this thread.
    pub fn status(&self) -> Result<c_int, EquipmentError> {
        self.lib.ibsta()
    }

    /// The number of bytes transferred by the most recent call of this thread.
    pub fn count(&self) -> Result<usize, EquipmentError> {
        self.lib.ibcntl()
    }
}

impl Transport for GpibTransport {
    fn read_raw(
        &mut self,
        max_bytes: usize,
        timeout: Option<Duration>,
    ) -> Result<Chunk, EquipmentError> {
        if !self.is_board {
            self.set_timeout(timeout)?;
        }
        let ibrd = self.lib.symbol::<ReadFn>(b"ibrd\0")?;
        let mut buf = vec![0u8; max_bytes.clamp(1, READ_CHUNK)];
        loop {
            // SAFETY: `buf` is valid for `buf.len()` bytes.
            let ibsta = unsafe { ibrd(self.handle, buf.as_mut_ptr(), buf.len() as c_long) };
            self.lib.check("ibrd", ibsta, timeout)?;
            let n = self.lib.ibcntl()?.min(buf.len());
            if ibsta & END != 0 {
                buf.truncate(n);
                return Ok(Chunk::end(buf));
            }
            if n > 0 {
                buf.truncate(n);
                return Ok(Chunk::data(buf));
            }
        }
    }

    fn write_raw(
        &mut self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, EquipmentError> {
        if !self.is_board {
            self.set_timeout(timeout)?;
        }
        let ibwrt = self.lib.symbol::<WriteFn>(b"ibwrt\0")?;
        // SAFETY: `data` is valid for `data.len()` bytes.
        let ibsta = unsafe { ibwrt(self.handle, data.as_ptr(), data.len() as c_long) };
        self.lib.check("ibwrt", ibsta, timeout)?;
        self.lib.ibcntl()
    }

    /// Take an owned handle offline. Errors are logged, not returned.
    fn close(&mut self) -> Result<(), EquipmentError> {
        if self.own && self.handle >= 0 {
            if let Err(e) = self.online(false) {
                log::warn!("gpib.ibonl({}, 0) failed: {e}", self.handle);
            }
            self.handle = -1;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), EquipmentError> {
        self.call("ibclr", b"ibclr\0").map(drop)
    }

    fn trigger(&mut self) -> Result<(), EquipmentError> {
        self.call("ibtrg", b"ibtrg\0").map(drop)
    }

    fn read_stb(&mut self) -> Result<u8, EquipmentError> {
        self.serial_poll()
    }

    fn interface_clear(&mut self) -> Result<(), EquipmentError> {
        self.call("ibsic", b"ibsic\0").map(drop)
    }

    fn remote(&mut self) -> Result<(), EquipmentError> {
        self.remote_enable(true).map(drop)
    }

    fn local(&mut self) -> Result<(), EquipmentError> {
        self.call("ibloc", b"ibloc\0").map(drop)
    }

    fn marks_end(&self) -> bool {
        true
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
