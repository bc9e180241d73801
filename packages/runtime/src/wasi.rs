//! A [`GuestEngine`] that runs WASI preview1 modules on wasmtime.
//!
//! Only the calls a command-line interpreter needs are provided. Every
//! filesystem and terminal operation goes through the [`SyncClient`]; files
//! are read whole on open and written back on close. Any other import traps
//! when the guest calls it.
//!
//! Each run gets its own wasmtime `Engine` so that an [`Interrupt`] can bump
//! the epoch without touching other guests.

use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use wasmtime::{Caller, Config, Engine, Linker, Memory, Module, Store, Trap};

use crate::bridge::{DirEntry, FileKind, OutputStream, SyncClient};
use crate::engine::{ExitHandler, GuestConfig, GuestEngine, Interrupt};
use crate::error::{EngineError, ServiceError};
use crate::namespace::{join_guest_path, MountTable};
use crate::resolver::RuntimeImage;

const MODULE: &str = "wasi_snapshot_preview1";

mod errno {
    pub const SUCCESS: i32 = 0;
    pub const ACCES: i32 = 2;
    pub const BADF: i32 = 8;
    pub const EXIST: i32 = 20;
    pub const FAULT: i32 = 21;
    pub const FBIG: i32 = 22;
    pub const INVAL: i32 = 28;
    pub const IO: i32 = 29;
    pub const ISDIR: i32 = 31;
    pub const NOENT: i32 = 44;
    pub const NOTDIR: i32 = 54;
    pub const NOTSUP: i32 = 58;
    pub const SPIPE: i32 = 69;
}

const FILETYPE_CHARACTER_DEVICE: u8 = 2;
const FILETYPE_DIRECTORY: u8 = 3;
const FILETYPE_REGULAR_FILE: u8 = 4;

const OFLAGS_CREAT: i32 = 1;
const OFLAGS_DIRECTORY: i32 = 2;
const OFLAGS_EXCL: i32 = 4;
const OFLAGS_TRUNC: i32 = 8;

const RIGHTS_FD_WRITE: i64 = 1 << 6;
const FDFLAGS_APPEND: i32 = 1;

const CLOCK_REALTIME: i32 = 0;

/// Largest file a guest may grow in memory, and the largest single write.
const MAX_FILE_SIZE: usize = 1 << 30;

/// Raised by `proc_exit` to unwind the guest.
#[derive(Debug, Error)]
#[error("guest exited with code {code}")]
struct GuestExit {
    code: i32,
}

/// Runs WASI command modules.
#[derive(Debug, Clone)]
pub struct WasiEngine {
    max_terminal_read: usize,
}

impl Default for WasiEngine {
    fn default() -> Self {
        Self {
            max_terminal_read: 4096,
        }
    }
}

impl WasiEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap on the bytes requested from the terminal by one `fd_read`.
    pub fn with_max_terminal_read(mut self, max: usize) -> Self {
        self.max_terminal_read = max.max(1);
        self
    }
}

impl GuestEngine for WasiEngine {
    fn run(
        &self,
        image: &RuntimeImage,
        client: SyncClient,
        config: GuestConfig,
        interrupt: &Interrupt,
        on_exit: ExitHandler,
    ) -> Result<(), EngineError> {
        let mut engine_config = Config::new();
        engine_config.epoch_interruption(true);
        let engine =
            Engine::new(&engine_config).map_err(|e| EngineError::Compile(e.to_string()))?;
        let module = Module::new(&engine, image.as_bytes())
            .map_err(|e| EngineError::Compile(e.to_string()))?;

        let mut linker = Linker::new(&engine);
        add_to_linker(&mut linker).map_err(|e| EngineError::Link(e.to_string()))?;
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(|e| EngineError::Link(e.to_string()))?;

        debug!(name = %config.name, argv = ?config.argv, "starting guest");
        let ctx = WasiCtx::new(client, config, on_exit, self.max_terminal_read);
        let mut store = Store::new(&engine, ctx);
        store.set_epoch_deadline(1);
        store.epoch_deadline_trap();

        let epoch = engine.clone();
        interrupt.on_trigger(move || epoch.increment_epoch());

        let instance = match linker.instantiate(&mut store, &module) {
            Ok(instance) => instance,
            Err(error) => return classify(error),
        };
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or(EngineError::Memory)?;
        store.data_mut().memory = Some(memory);
        let start = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(|e| EngineError::Link(e.to_string()))?;

        let outcome = start.call(&mut store, ());
        store.data_mut().flush_all();
        match outcome {
            Ok(()) => Ok(()),
            Err(error) => classify(error),
        }
    }
}

fn classify(error: wasmtime::Error) -> Result<(), EngineError> {
    if let Some(exit) = error.downcast_ref::<GuestExit>() {
        debug!(code = exit.code, "guest called proc_exit");
        return Ok(());
    }
    if matches!(error.downcast_ref::<Trap>(), Some(Trap::Interrupt)) {
        return Err(EngineError::Interrupted);
    }
    Err(EngineError::Trap(format!("{:#}", error)))
}

enum Descriptor {
    Stdin,
    Stdout,
    Stderr,
    Directory(DirHandle),
    File(FileHandle),
}

struct DirHandle {
    guest_path: String,
    preopen: bool,
    entries: Option<Vec<DirEntry>>,
}

struct FileHandle {
    uri: Url,
    data: Vec<u8>,
    position: usize,
    append: bool,
    writable: bool,
    dirty: bool,
}

impl FileHandle {
    fn flush(self, client: &SyncClient) -> Result<(), i32> {
        if !self.dirty {
            return Ok(());
        }
        client
            .write_file(&self.uri, Bytes::from(self.data))
            .map_err(|e| service_errno(&e))
    }
}

struct WasiCtx {
    client: SyncClient,
    mounts: MountTable,
    args: Vec<String>,
    env: Vec<String>,
    fds: BTreeMap<u32, Descriptor>,
    next_fd: u32,
    on_exit: ExitHandler,
    memory: Option<Memory>,
    started: Instant,
    max_terminal_read: usize,
}

impl WasiCtx {
    fn new(
        client: SyncClient,
        config: GuestConfig,
        on_exit: ExitHandler,
        max_terminal_read: usize,
    ) -> Self {
        let mut fds = BTreeMap::new();
        fds.insert(0, Descriptor::Stdin);
        fds.insert(1, Descriptor::Stdout);
        fds.insert(2, Descriptor::Stderr);
        let mut ctx = Self {
            client,
            args: config.argv,
            env: config
                .env
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect(),
            fds,
            next_fd: 3,
            on_exit,
            memory: None,
            started: Instant::now(),
            max_terminal_read,
            mounts: config.mounts,
        };
        // Preopens are numbered from 3 in mount order.
        let preopens: Vec<String> = ctx
            .mounts
            .mounts()
            .iter()
            .map(|mount| mount.guest_path.clone())
            .collect();
        for guest_path in preopens {
            ctx.insert(Descriptor::Directory(DirHandle {
                guest_path,
                preopen: true,
                entries: None,
            }));
        }
        ctx
    }

    fn insert(&mut self, descriptor: Descriptor) -> u32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, descriptor);
        fd
    }

    fn get(&self, fd: i32) -> Result<&Descriptor, i32> {
        self.fds.get(&(fd as u32)).ok_or(errno::BADF)
    }

    fn get_mut(&mut self, fd: i32) -> Result<&mut Descriptor, i32> {
        self.fds.get_mut(&(fd as u32)).ok_or(errno::BADF)
    }

    /// Guest path of `path` relative to the directory open at `dirfd`.
    fn child_path(&self, dirfd: i32, path: &str) -> Result<String, i32> {
        match self.get(dirfd)? {
            Descriptor::Directory(dir) => Ok(join_guest_path(&dir.guest_path, path)),
            _ => Err(errno::NOTDIR),
        }
    }

    fn flush_all(&mut self) {
        let open: Vec<u32> = self
            .fds
            .iter()
            .filter(|(_, d)| matches!(d, Descriptor::File(file) if file.dirty))
            .map(|(fd, _)| *fd)
            .collect();
        for fd in open {
            if let Some(Descriptor::File(file)) = self.fds.remove(&fd) {
                let uri = file.uri.clone();
                if let Err(code) = file.flush(&self.client) {
                    warn!(%uri, errno = code, "failed to write back guest file");
                }
            }
        }
    }
}

fn service_errno(error: &ServiceError) -> i32 {
    match error {
        ServiceError::NotFound(_) => errno::NOENT,
        ServiceError::PermissionDenied(_) => errno::ACCES,
        ServiceError::IsADirectory(_) => errno::ISDIR,
        ServiceError::Unsupported(_) => errno::NOTSUP,
        ServiceError::Io(_) | ServiceError::Closed => errno::IO,
    }
}

fn status(result: Result<(), i32>) -> wasmtime::Result<i32> {
    Ok(match result {
        Ok(()) => errno::SUCCESS,
        Err(code) => code,
    })
}

fn filetype(kind: FileKind) -> u8 {
    match kind {
        FileKind::File => FILETYPE_REGULAR_FILE,
        FileKind::Directory => FILETYPE_DIRECTORY,
    }
}

// Guest memory access.

fn memory(caller: &Caller<'_, WasiCtx>) -> Result<Memory, i32> {
    caller.data().memory.ok_or(errno::FAULT)
}

/// Offset of `len` bytes at `ptr`, checked against the current memory size.
fn guest_range(caller: &Caller<'_, WasiCtx>, ptr: i32, len: u32) -> Result<usize, i32> {
    let memory = memory(caller)?;
    let start = ptr as u32 as usize;
    match start.checked_add(len as usize) {
        Some(end) if end <= memory.data_size(caller) => Ok(start),
        _ => Err(errno::FAULT),
    }
}

fn read_bytes(caller: &Caller<'_, WasiCtx>, ptr: i32, len: u32) -> Result<Vec<u8>, i32> {
    let start = guest_range(caller, ptr, len)?;
    let mut buf = vec![0u8; len as usize];
    memory(caller)?
        .read(caller, start, &mut buf)
        .map_err(|_| errno::FAULT)?;
    Ok(buf)
}

fn read_string(caller: &Caller<'_, WasiCtx>, ptr: i32, len: i32) -> Result<String, i32> {
    String::from_utf8(read_bytes(caller, ptr, len as u32)?).map_err(|_| errno::INVAL)
}

fn write_bytes(caller: &mut Caller<'_, WasiCtx>, ptr: i32, bytes: &[u8]) -> Result<(), i32> {
    let memory = memory(caller)?;
    memory
        .write(&mut *caller, ptr as u32 as usize, bytes)
        .map_err(|_| errno::FAULT)
}

fn write_u32(caller: &mut Caller<'_, WasiCtx>, ptr: i32, value: u32) -> Result<(), i32> {
    write_bytes(caller, ptr, &value.to_le_bytes())
}

fn write_u64(caller: &mut Caller<'_, WasiCtx>, ptr: i32, value: u64) -> Result<(), i32> {
    write_bytes(caller, ptr, &value.to_le_bytes())
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// `(buf, len)` pairs of an iovec array.
fn iovecs(caller: &Caller<'_, WasiCtx>, iovs: i32, count: i32) -> Result<Vec<(i32, u32)>, i32> {
    let size = (count as u32).checked_mul(8).ok_or(errno::INVAL)?;
    let raw = read_bytes(caller, iovs, size)?;
    Ok(raw
        .chunks_exact(8)
        .map(|chunk| (le_u32(&chunk[0..4]) as i32, le_u32(&chunk[4..8])))
        .collect())
}

fn write_filestat(
    caller: &mut Caller<'_, WasiCtx>,
    ptr: i32,
    filetype: u8,
    size: u64,
) -> Result<(), i32> {
    let mut buf = [0u8; 64];
    buf[16] = filetype;
    buf[24..32].copy_from_slice(&1u64.to_le_bytes());
    buf[32..40].copy_from_slice(&size.to_le_bytes());
    write_bytes(caller, ptr, &buf)
}

fn string_sizes(strings: &[String]) -> (u32, u32) {
    let size = strings.iter().map(|s| s.len() + 1).sum::<usize>();
    (strings.len() as u32, size as u32)
}

/// Address of the `index`th pointer in a guest pointer array.
fn list_slot(list: i32, index: usize) -> i32 {
    (list as u32).wrapping_add((index as u32).wrapping_mul(4)) as i32
}

fn write_string_list(
    caller: &mut Caller<'_, WasiCtx>,
    strings: Vec<String>,
    list: i32,
    buf: i32,
) -> Result<(), i32> {
    let mut offset = 0u32;
    for (index, string) in strings.iter().enumerate() {
        let target = (buf as u32).wrapping_add(offset);
        write_u32(caller, list_slot(list, index), target)?;
        let mut bytes = string.as_bytes().to_vec();
        bytes.push(0);
        write_bytes(caller, target as i32, &bytes)?;
        offset += bytes.len() as u32;
    }
    Ok(())
}

// Host functions.

fn add_to_linker(linker: &mut Linker<WasiCtx>) -> wasmtime::Result<()> {
    linker.func_wrap(MODULE, "args_sizes_get", args_sizes_get)?;
    linker.func_wrap(MODULE, "args_get", args_get)?;
    linker.func_wrap(MODULE, "environ_sizes_get", environ_sizes_get)?;
    linker.func_wrap(MODULE, "environ_get", environ_get)?;
    linker.func_wrap(MODULE, "fd_write", fd_write)?;
    linker.func_wrap(MODULE, "fd_read", fd_read)?;
    linker.func_wrap(MODULE, "fd_seek", fd_seek)?;
    linker.func_wrap(MODULE, "fd_tell", fd_tell)?;
    linker.func_wrap(MODULE, "fd_close", fd_close)?;
    linker.func_wrap(MODULE, "fd_fdstat_get", fd_fdstat_get)?;
    linker.func_wrap(MODULE, "fd_fdstat_set_flags", fd_fdstat_set_flags)?;
    linker.func_wrap(MODULE, "fd_prestat_get", fd_prestat_get)?;
    linker.func_wrap(MODULE, "fd_prestat_dir_name", fd_prestat_dir_name)?;
    linker.func_wrap(MODULE, "fd_filestat_get", fd_filestat_get)?;
    linker.func_wrap(MODULE, "fd_readdir", fd_readdir)?;
    linker.func_wrap(MODULE, "path_open", path_open)?;
    linker.func_wrap(MODULE, "path_filestat_get", path_filestat_get)?;
    linker.func_wrap(MODULE, "clock_res_get", clock_res_get)?;
    linker.func_wrap(MODULE, "clock_time_get", clock_time_get)?;
    linker.func_wrap(MODULE, "random_get", random_get)?;
    linker.func_wrap(MODULE, "sched_yield", sched_yield)?;
    linker.func_wrap(MODULE, "proc_exit", proc_exit)?;
    Ok(())
}

fn args_sizes_get(mut caller: Caller<'_, WasiCtx>, count: i32, size: i32) -> wasmtime::Result<i32> {
    let (n, bytes) = string_sizes(&caller.data().args);
    status(write_u32(&mut caller, count, n).and_then(|()| write_u32(&mut caller, size, bytes)))
}

fn args_get(mut caller: Caller<'_, WasiCtx>, list: i32, buf: i32) -> wasmtime::Result<i32> {
    let args = caller.data().args.clone();
    status(write_string_list(&mut caller, args, list, buf))
}

fn environ_sizes_get(
    mut caller: Caller<'_, WasiCtx>,
    count: i32,
    size: i32,
) -> wasmtime::Result<i32> {
    let (n, bytes) = string_sizes(&caller.data().env);
    status(write_u32(&mut caller, count, n).and_then(|()| write_u32(&mut caller, size, bytes)))
}

fn environ_get(mut caller: Caller<'_, WasiCtx>, list: i32, buf: i32) -> wasmtime::Result<i32> {
    let env = caller.data().env.clone();
    status(write_string_list(&mut caller, env, list, buf))
}

fn fd_write(
    mut caller: Caller<'_, WasiCtx>,
    fd: i32,
    iovs: i32,
    iovs_len: i32,
    nwritten: i32,
) -> wasmtime::Result<i32> {
    status(write_fd(&mut caller, fd, iovs, iovs_len, nwritten))
}

fn write_fd(
    caller: &mut Caller<'_, WasiCtx>,
    fd: i32,
    iovs: i32,
    iovs_len: i32,
    nwritten: i32,
) -> Result<(), i32> {
    let buffers = iovecs(caller, iovs, iovs_len)?;
    let total = buffers
        .iter()
        .try_fold(0usize, |total, (_, len)| total.checked_add(*len as usize))
        .filter(|total| *total <= MAX_FILE_SIZE)
        .ok_or(errno::FBIG)?;
    let mut data = Vec::with_capacity(total);
    for (ptr, len) in buffers {
        data.extend(read_bytes(caller, ptr, len)?);
    }
    let written = data.len() as u32;

    let ctx = caller.data_mut();
    let stream = match ctx.fds.get_mut(&(fd as u32)).ok_or(errno::BADF)? {
        Descriptor::Stdout => Some(OutputStream::Stdout),
        Descriptor::Stderr => Some(OutputStream::Stderr),
        Descriptor::File(file) => {
            if !file.writable {
                return Err(errno::BADF);
            }
            if file.append {
                file.position = file.data.len();
            }
            let end = file
                .position
                .checked_add(data.len())
                .filter(|end| *end <= MAX_FILE_SIZE)
                .ok_or(errno::FBIG)?;
            if file.data.len() < end {
                file.data.resize(end, 0);
            }
            file.data[file.position..end].copy_from_slice(&data);
            file.position = end;
            file.dirty = true;
            None
        }
        Descriptor::Directory(_) => return Err(errno::ISDIR),
        Descriptor::Stdin => return Err(errno::BADF),
    };
    if let Some(stream) = stream {
        ctx.client
            .terminal_write(stream, Bytes::from(data))
            .map_err(|e| service_errno(&e))?;
    }
    write_u32(caller, nwritten, written)
}

fn fd_read(
    mut caller: Caller<'_, WasiCtx>,
    fd: i32,
    iovs: i32,
    iovs_len: i32,
    nread: i32,
) -> wasmtime::Result<i32> {
    status(read_fd(&mut caller, fd, iovs, iovs_len, nread))
}

fn read_fd(
    caller: &mut Caller<'_, WasiCtx>,
    fd: i32,
    iovs: i32,
    iovs_len: i32,
    nread: i32,
) -> Result<(), i32> {
    let buffers = iovecs(caller, iovs, iovs_len)?;
    let capacity = buffers.iter().map(|(_, len)| *len as usize).sum::<usize>();

    let ctx = caller.data_mut();
    let data = match ctx.fds.get_mut(&(fd as u32)).ok_or(errno::BADF)? {
        Descriptor::Stdin => ctx
            .client
            .terminal_read(capacity.min(ctx.max_terminal_read))
            .map_err(|e| service_errno(&e))?
            .to_vec(),
        Descriptor::File(file) => {
            let start = file.position.min(file.data.len());
            let end = start.saturating_add(capacity).min(file.data.len());
            file.position = end;
            file.data[start..end].to_vec()
        }
        Descriptor::Directory(_) => return Err(errno::ISDIR),
        Descriptor::Stdout | Descriptor::Stderr => return Err(errno::BADF),
    };

    let mut offset = 0;
    for (ptr, len) in buffers {
        if offset >= data.len() {
            break;
        }
        let n = (len as usize).min(data.len() - offset);
        write_bytes(caller, ptr, &data[offset..offset + n])?;
        offset += n;
    }
    write_u32(caller, nread, offset as u32)
}

fn fd_seek(
    mut caller: Caller<'_, WasiCtx>,
    fd: i32,
    offset: i64,
    whence: i32,
    new_offset: i32,
) -> wasmtime::Result<i32> {
    let result = seek(caller.data_mut(), fd, offset, whence)
        .and_then(|position| write_u64(&mut caller, new_offset, position));
    status(result)
}

fn fd_tell(mut caller: Caller<'_, WasiCtx>, fd: i32, out: i32) -> wasmtime::Result<i32> {
    let result = seek(caller.data_mut(), fd, 0, 1)
        .and_then(|position| write_u64(&mut caller, out, position));
    status(result)
}

fn seek(ctx: &mut WasiCtx, fd: i32, offset: i64, whence: i32) -> Result<u64, i32> {
    let file = match ctx.get_mut(fd)? {
        Descriptor::File(file) => file,
        Descriptor::Directory(_) => return Err(errno::BADF),
        _ => return Err(errno::SPIPE),
    };
    let base = match whence {
        0 => 0,
        1 => file.position as i64,
        2 => file.data.len() as i64,
        _ => return Err(errno::INVAL),
    };
    let target = base
        .checked_add(offset)
        .filter(|target| *target >= 0)
        .ok_or(errno::INVAL)?;
    if target as u64 > MAX_FILE_SIZE as u64 {
        return Err(errno::FBIG);
    }
    file.position = target as usize;
    Ok(target as u64)
}

fn fd_close(mut caller: Caller<'_, WasiCtx>, fd: i32) -> wasmtime::Result<i32> {
    let ctx = caller.data_mut();
    let result = match ctx.fds.remove(&(fd as u32)) {
        Some(Descriptor::File(file)) => file.flush(&ctx.client),
        Some(_) => Ok(()),
        None => Err(errno::BADF),
    };
    status(result)
}

fn fd_fdstat_get(mut caller: Caller<'_, WasiCtx>, fd: i32, out: i32) -> wasmtime::Result<i32> {
    let described = caller.data().get(fd).map(|descriptor| match descriptor {
        Descriptor::Stdin | Descriptor::Stdout | Descriptor::Stderr => {
            (FILETYPE_CHARACTER_DEVICE, 0u16)
        }
        Descriptor::Directory(_) => (FILETYPE_DIRECTORY, 0),
        Descriptor::File(file) => (FILETYPE_REGULAR_FILE, u16::from(file.append)),
    });
    let result = described.and_then(|(filetype, flags)| {
        let mut buf = [0u8; 24];
        buf[0] = filetype;
        buf[2..4].copy_from_slice(&flags.to_le_bytes());
        buf[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
        buf[16..24].copy_from_slice(&u64::MAX.to_le_bytes());
        write_bytes(&mut caller, out, &buf)
    });
    status(result)
}

fn fd_fdstat_set_flags(mut caller: Caller<'_, WasiCtx>, fd: i32, flags: i32) -> wasmtime::Result<i32> {
    let result = caller.data_mut().get_mut(fd).map(|descriptor| {
        if let Descriptor::File(file) = descriptor {
            file.append = flags & FDFLAGS_APPEND != 0;
        }
    });
    status(result)
}

fn fd_prestat_get(mut caller: Caller<'_, WasiCtx>, fd: i32, out: i32) -> wasmtime::Result<i32> {
    let name_len = match caller.data().get(fd) {
        Ok(Descriptor::Directory(dir)) if dir.preopen => dir.guest_path.len() as u32,
        _ => return status(Err(errno::BADF)),
    };
    let mut buf = [0u8; 8];
    buf[4..8].copy_from_slice(&name_len.to_le_bytes());
    status(write_bytes(&mut caller, out, &buf))
}

fn fd_prestat_dir_name(
    mut caller: Caller<'_, WasiCtx>,
    fd: i32,
    path: i32,
    path_len: i32,
) -> wasmtime::Result<i32> {
    let name = match caller.data().get(fd) {
        Ok(Descriptor::Directory(dir)) if dir.preopen => dir.guest_path.clone(),
        _ => return status(Err(errno::BADF)),
    };
    let len = name.len().min(path_len.max(0) as usize);
    status(write_bytes(&mut caller, path, &name.as_bytes()[..len]))
}

fn fd_filestat_get(mut caller: Caller<'_, WasiCtx>, fd: i32, out: i32) -> wasmtime::Result<i32> {
    let described = caller.data().get(fd).map(|descriptor| match descriptor {
        Descriptor::Stdin | Descriptor::Stdout | Descriptor::Stderr => {
            (FILETYPE_CHARACTER_DEVICE, 0)
        }
        Descriptor::Directory(_) => (FILETYPE_DIRECTORY, 0),
        Descriptor::File(file) => (FILETYPE_REGULAR_FILE, file.data.len() as u64),
    });
    let result =
        described.and_then(|(filetype, size)| write_filestat(&mut caller, out, filetype, size));
    status(result)
}

fn fd_readdir(
    mut caller: Caller<'_, WasiCtx>,
    fd: i32,
    buf: i32,
    buf_len: i32,
    cookie: i64,
    bufused: i32,
) -> wasmtime::Result<i32> {
    let listing = directory_listing(caller.data_mut(), fd, buf_len.max(0) as usize, cookie);
    let result = listing.and_then(|bytes| {
        write_bytes(&mut caller, buf, &bytes)?;
        write_u32(&mut caller, bufused, bytes.len() as u32)
    });
    status(result)
}

/// Serialized dirents starting at `cookie`, truncated to `max` bytes.
fn directory_listing(ctx: &mut WasiCtx, fd: i32, max: usize, cookie: i64) -> Result<Vec<u8>, i32> {
    let skip = usize::try_from(cookie).map_err(|_| errno::INVAL)?;
    let dir = match ctx.fds.get_mut(&(fd as u32)).ok_or(errno::BADF)? {
        Descriptor::Directory(dir) => dir,
        _ => return Err(errno::NOTDIR),
    };
    if dir.entries.is_none() {
        let uri = ctx.mounts.resolve(&dir.guest_path).ok_or(errno::NOENT)?;
        let entries = ctx
            .client
            .read_directory(&uri)
            .map_err(|e| service_errno(&e))?;
        dir.entries = Some(entries);
    }

    let mut out = Vec::new();
    for (index, entry) in dir.entries.iter().flatten().enumerate().skip(skip) {
        let next = index as u64 + 1;
        out.extend_from_slice(&next.to_le_bytes());
        out.extend_from_slice(&next.to_le_bytes());
        out.extend_from_slice(&(entry.name.len() as u32).to_le_bytes());
        out.extend_from_slice(&[filetype(entry.kind), 0, 0, 0]);
        out.extend_from_slice(entry.name.as_bytes());
        if out.len() >= max {
            break;
        }
    }
    out.truncate(max);
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn path_open(
    mut caller: Caller<'_, WasiCtx>,
    dirfd: i32,
    _dirflags: i32,
    path: i32,
    path_len: i32,
    oflags: i32,
    rights: i64,
    _rights_inheriting: i64,
    fdflags: i32,
    opened: i32,
) -> wasmtime::Result<i32> {
    let result = read_string(&caller, path, path_len)
        .and_then(|path| open(caller.data_mut(), dirfd, &path, oflags, rights, fdflags))
        .and_then(|fd| write_u32(&mut caller, opened, fd));
    status(result)
}

fn open(
    ctx: &mut WasiCtx,
    dirfd: i32,
    path: &str,
    oflags: i32,
    rights: i64,
    fdflags: i32,
) -> Result<u32, i32> {
    let guest_path = ctx.child_path(dirfd, path)?;
    let uri = ctx.mounts.resolve(&guest_path).ok_or(errno::NOENT)?;
    let exclusive = oflags & OFLAGS_CREAT != 0 && oflags & OFLAGS_EXCL != 0;
    let writable = rights & RIGHTS_FD_WRITE != 0;
    let append = fdflags & FDFLAGS_APPEND != 0;

    let descriptor = match ctx.client.stat(&uri) {
        Ok(stat) if stat.kind == FileKind::Directory => {
            if exclusive {
                return Err(errno::EXIST);
            }
            Descriptor::Directory(DirHandle {
                guest_path,
                preopen: false,
                entries: None,
            })
        }
        Ok(_) => {
            if oflags & OFLAGS_DIRECTORY != 0 {
                return Err(errno::NOTDIR);
            }
            if exclusive {
                return Err(errno::EXIST);
            }
            let truncate = oflags & OFLAGS_TRUNC != 0;
            let data = if truncate {
                Vec::new()
            } else {
                ctx.client
                    .read_file(&uri)
                    .map_err(|e| service_errno(&e))?
                    .to_vec()
            };
            Descriptor::File(FileHandle {
                uri,
                data,
                position: 0,
                append,
                writable,
                dirty: truncate && writable,
            })
        }
        Err(ServiceError::NotFound(_)) if oflags & OFLAGS_CREAT != 0 => {
            Descriptor::File(FileHandle {
                uri,
                data: Vec::new(),
                position: 0,
                append,
                writable,
                dirty: true,
            })
        }
        Err(error) => return Err(service_errno(&error)),
    };
    Ok(ctx.insert(descriptor))
}

fn path_filestat_get(
    mut caller: Caller<'_, WasiCtx>,
    dirfd: i32,
    _flags: i32,
    path: i32,
    path_len: i32,
    out: i32,
) -> wasmtime::Result<i32> {
    let result = read_string(&caller, path, path_len)
        .and_then(|path| {
            let ctx = caller.data();
            let guest_path = ctx.child_path(dirfd, &path)?;
            let uri = ctx.mounts.resolve(&guest_path).ok_or(errno::NOENT)?;
            ctx.client.stat(&uri).map_err(|e| service_errno(&e))
        })
        .and_then(|stat| write_filestat(&mut caller, out, filetype(stat.kind), stat.size));
    status(result)
}

fn clock_res_get(mut caller: Caller<'_, WasiCtx>, _id: i32, out: i32) -> wasmtime::Result<i32> {
    status(write_u64(&mut caller, out, 1_000))
}

fn clock_time_get(
    mut caller: Caller<'_, WasiCtx>,
    id: i32,
    _precision: i64,
    out: i32,
) -> wasmtime::Result<i32> {
    let now = if id == CLOCK_REALTIME {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .map_err(|_| errno::IO)
    } else if (1..=3).contains(&id) {
        Ok(caller.data().started.elapsed().as_nanos() as u64)
    } else {
        Err(errno::INVAL)
    };
    status(now.and_then(|now| write_u64(&mut caller, out, now)))
}

fn random_get(mut caller: Caller<'_, WasiCtx>, buf: i32, len: i32) -> wasmtime::Result<i32> {
    let result = guest_range(&caller, buf, len as u32).and_then(|_| {
        let mut bytes = vec![0u8; len as u32 as usize];
        rand::thread_rng().fill_bytes(&mut bytes);
        write_bytes(&mut caller, buf, &bytes)
    });
    status(result)
}

fn sched_yield(_caller: Caller<'_, WasiCtx>) -> wasmtime::Result<i32> {
    std::thread::yield_now();
    Ok(errno::SUCCESS)
}

fn proc_exit(mut caller: Caller<'_, WasiCtx>, code: i32) -> wasmtime::Result<()> {
    let ctx = caller.data_mut();
    ctx.flush_all();
    (ctx.on_exit)(code);
    ctx.client.exit(code);
    Err(wasmtime::Error::new(GuestExit { code }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{self, FileStat, HostServices, ServiceResult};
    use crate::engine::GuestProfile;
    use crate::namespace::WorkspaceFolder;
    use crate::resolver::RuntimeLocation;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, OnceLock};
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryHost {
        files: Mutex<HashMap<String, Bytes>>,
        stdout: Mutex<Vec<u8>>,
        exits: Mutex<Vec<i32>>,
    }

    impl MemoryHost {
        fn with_file(uri: &str, contents: &'static [u8]) -> Arc<Self> {
            let host = Self::default();
            host.files
                .lock()
                .unwrap()
                .insert(uri.to_string(), Bytes::from_static(contents));
            Arc::new(host)
        }
    }

    #[async_trait]
    impl HostServices for MemoryHost {
        async fn workspace_folders(&self) -> Vec<WorkspaceFolder> {
            Vec::new()
        }

        async fn active_document(&self) -> Option<Url> {
            None
        }

        async fn read_file(&self, uri: &Url) -> ServiceResult<Bytes> {
            self.files
                .lock()
                .unwrap()
                .get(uri.as_str())
                .cloned()
                .ok_or_else(|| ServiceError::NotFound(uri.to_string()))
        }

        async fn write_file(&self, uri: &Url, contents: Bytes) -> ServiceResult<()> {
            self.files
                .lock()
                .unwrap()
                .insert(uri.to_string(), contents);
            Ok(())
        }

        async fn stat(&self, uri: &Url) -> ServiceResult<FileStat> {
            let files = self.files.lock().unwrap();
            match files.get(uri.as_str()) {
                Some(bytes) => Ok(FileStat::file(bytes.len() as u64)),
                None => Err(ServiceError::NotFound(uri.to_string())),
            }
        }

        async fn terminal_write(&self, _stream: OutputStream, bytes: Bytes) -> ServiceResult<()> {
            self.stdout.lock().unwrap().extend_from_slice(&bytes);
            Ok(())
        }

        async fn terminal_read(&self, _max: usize) -> ServiceResult<Bytes> {
            Ok(Bytes::new())
        }

        fn exit(&self, code: i32) {
            self.exits.lock().unwrap().push(code);
        }
    }

    fn config() -> GuestConfig {
        let location = RuntimeLocation {
            repository: Url::parse("vscode-vfs://github/o/r").unwrap(),
            subpath: None,
        };
        let folders = [WorkspaceFolder::new(
            "proj",
            Url::parse("file:///proj").unwrap(),
        )];
        GuestProfile::default().config(MountTable::compute(&folders, &location), None)
    }

    struct Outcome {
        result: Result<(), EngineError>,
        exit_code: Option<i32>,
    }

    async fn run_wat(wat: &'static str, host: Arc<MemoryHost>, interrupt: Interrupt) -> Outcome {
        let (connection, port) = bridge::channel();
        let serve = tokio::spawn(connection.serve(host));
        let guest = tokio::task::spawn_blocking(move || {
            let client = port.connect().unwrap();
            let recorded = Arc::new(OnceLock::new());
            let on_exit: ExitHandler = {
                let recorded = recorded.clone();
                Box::new(move |code| {
                    let _ = recorded.set(code);
                })
            };
            let image = RuntimeImage::new(wat.as_bytes().to_vec());
            let result = WasiEngine::new().run(&image, client, config(), &interrupt, on_exit);
            Outcome {
                result,
                exit_code: recorded.get().copied(),
            }
        });
        let outcome = guest.await.unwrap();
        serve.await.unwrap();
        outcome
    }

    const HELLO: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (memory (export "memory") 1)
          (data (i32.const 16) "hello\n")
          (func (export "_start")
            (i32.store (i32.const 0) (i32.const 16))
            (i32.store (i32.const 4) (i32.const 6))
            (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))
            (call $proc_exit (i32.const 3))))
    "#;

    const CAT: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "path_open"
            (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_read"
            (func $fd_read (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 100) "a.txt")
          (func (export "_start")
            (if (call $path_open (i32.const 3) (i32.const 0) (i32.const 100) (i32.const 5)
                  (i32.const 0) (i64.const 2) (i64.const 0) (i32.const 0) (i32.const 200))
              (then unreachable))
            (i32.store (i32.const 0) (i32.const 300))
            (i32.store (i32.const 4) (i32.const 64))
            (if (call $fd_read (i32.load (i32.const 200)) (i32.const 0) (i32.const 1) (i32.const 8))
              (then unreachable))
            (i32.store (i32.const 4) (i32.load (i32.const 8)))
            (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 12)))))
    "#;

    const WRITE_NEW: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "path_open"
            (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_close" (func $fd_close (param i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 100) "out.txt")
          (data (i32.const 120) "written")
          (func (export "_start")
            (if (call $path_open (i32.const 3) (i32.const 0) (i32.const 100) (i32.const 7)
                  (i32.const 1) (i64.const 64) (i64.const 0) (i32.const 0) (i32.const 200))
              (then unreachable))
            (i32.store (i32.const 0) (i32.const 120))
            (i32.store (i32.const 4) (i32.const 7))
            (drop (call $fd_write (i32.load (i32.const 200)) (i32.const 0) (i32.const 1) (i32.const 8)))
            (drop (call $fd_close (i32.load (i32.const 200))))))
    "#;

    // Exit code packs three errnos: huge seek, seek to the size limit, write past it.
    const SEEK_PAST_LIMIT: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "path_open"
            (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_seek"
            (func $fd_seek (param i32 i64 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (memory (export "memory") 1)
          (data (i32.const 100) "big.bin")
          (data (i32.const 120) "x")
          (func (export "_start")
            (local $fd i32) (local $huge i32) (local $limit i32) (local $write i32)
            (if (call $path_open (i32.const 3) (i32.const 0) (i32.const 100) (i32.const 7)
                  (i32.const 1) (i64.const 64) (i64.const 0) (i32.const 0) (i32.const 200))
              (then unreachable))
            (local.set $fd (i32.load (i32.const 200)))
            (local.set $huge
              (call $fd_seek (local.get $fd) (i64.const 0x7fffffffffffffff) (i32.const 0) (i32.const 300)))
            (local.set $limit
              (call $fd_seek (local.get $fd) (i64.const 1073741824) (i32.const 0) (i32.const 300)))
            (i32.store (i32.const 0) (i32.const 120))
            (i32.store (i32.const 4) (i32.const 1))
            (local.set $write
              (call $fd_write (local.get $fd) (i32.const 0) (i32.const 1) (i32.const 8)))
            (call $proc_exit
              (i32.add
                (i32.add (i32.mul (local.get $huge) (i32.const 10000))
                         (i32.mul (local.get $limit) (i32.const 100)))
                (local.get $write)))))
    "#;

    const RANDOM_TOO_LONG: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "random_get"
            (func $random_get (param i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (memory (export "memory") 1)
          (func (export "_start")
            (call $proc_exit (call $random_get (i32.const 16) (i32.const 0x7fffffff)))))
    "#;

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_stdout_and_exits() {
        let host = Arc::new(MemoryHost::default());
        let outcome = run_wat(HELLO, host.clone(), Interrupt::new()).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(host.stdout.lock().unwrap().as_slice(), b"hello\n");
        assert_eq!(host.exits.lock().unwrap().as_slice(), &[3]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reads_workspace_file() {
        let host = MemoryHost::with_file("file:///proj/a.txt", b"from the host");
        let outcome = run_wat(CAT, host.clone(), Interrupt::new()).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.exit_code, None);
        assert_eq!(host.stdout.lock().unwrap().as_slice(), b"from the host");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn created_file_is_written_back_on_close() {
        let host = Arc::new(MemoryHost::default());
        let outcome = run_wat(WRITE_NEW, host.clone(), Interrupt::new()).await;
        assert!(outcome.result.is_ok());
        assert_eq!(
            host.files.lock().unwrap().get("file:///proj/out.txt"),
            Some(&Bytes::from_static(b"written"))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_imports_trap_when_called() {
        let wat = r#"
            (module
              (import "wasi_snapshot_preview1" "poll_oneoff"
                (func $poll (param i32 i32 i32 i32) (result i32)))
              (memory (export "memory") 1)
              (func (export "_start")
                (drop (call $poll (i32.const 0) (i32.const 0) (i32.const 0) (i32.const 0)))))
        "#;
        let outcome = run_wat(wat, Arc::new(MemoryHost::default()), Interrupt::new()).await;
        assert!(matches!(outcome.result, Err(EngineError::Trap(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_memory_is_reported() {
        let wat = r#"(module (func (export "_start")))"#;
        let outcome = run_wat(wat, Arc::new(MemoryHost::default()), Interrupt::new()).await;
        assert!(matches!(outcome.result, Err(EngineError::Memory)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_image_fails_to_compile() {
        let outcome = run_wat("not wasm", Arc::new(MemoryHost::default()), Interrupt::new()).await;
        assert!(matches!(outcome.result, Err(EngineError::Compile(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupt_stops_a_spinning_guest() {
        let wat = r#"
            (module
              (memory (export "memory") 1)
              (func (export "_start") (loop $spin (br $spin))))
        "#;
        let interrupt = Interrupt::new();
        let trigger = interrupt.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            trigger.trigger();
        });
        let outcome = run_wat(wat, Arc::new(MemoryHost::default()), interrupt).await;
        assert!(matches!(outcome.result, Err(EngineError::Interrupted)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_file_offsets_fail_with_fbig() {
        let host = Arc::new(MemoryHost::default());
        let outcome = run_wat(SEEK_PAST_LIMIT, host.clone(), Interrupt::new()).await;
        assert!(outcome.result.is_ok());
        let expected = errno::FBIG * 10000 + errno::SUCCESS * 100 + errno::FBIG;
        assert_eq!(outcome.exit_code, Some(expected));
        // The rejected write leaves the created file empty.
        assert_eq!(
            host.files.lock().unwrap().get("file:///proj/big.bin"),
            Some(&Bytes::new())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn random_get_rejects_lengths_beyond_memory() {
        let outcome = run_wat(RANDOM_TOO_LONG, Arc::new(MemoryHost::default()), Interrupt::new()).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.exit_code, Some(errno::FAULT));
    }

    #[test]
    fn list_slots_wrap_instead_of_overflowing() {
        assert_eq!(list_slot(16, 2), 24);
        assert_eq!(list_slot(i32::MAX - 3, 1), i32::MIN);
    }
}
