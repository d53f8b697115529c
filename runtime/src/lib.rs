//! A single-threaded, raw-`poll(2)`-based I/O reactor for `stakker`.
//!
//! Registers one `pollfd` per socket and drives `stakker`'s deferral queue
//! between polls. Buffers are plain `Vec<u8>`, and a socket can be
//! registered in `FrameMode::Lines` so a stream (Unix-domain) connection's
//! bytes are accumulated and split on `\n` instead of being forwarded as one
//! frame per `recv()` call. A `Listener` type handles `accept()`-based
//! sockets, and a socket can be marked `closable` so a disconnecting peer is
//! quietly deregistered instead of aborting the whole reactor.
extern crate alloc;

use alloc::collections::VecDeque;
use core::cell::RefCell;
use core::time::Duration;
use std::io::{self, ErrorKind};

use log::error;
use stakker::Fwd;

mod rt;
pub mod logger;
pub mod time;

pub use rt::*;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{accept, c_void as BufType, poll, pollfd as Poll, recv, send, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use u8 as BufType;
	pub use windows_sys::Win32::Networking::WinSock::{
		accept, recv, send, WSAPoll as poll, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN, POLLWRNORM as POLLOUT, SOCKET as RawFd, WSAPOLLFD as Poll,
	};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}
}

pub use sys::AsRawFd;
use sys::*;
use utils::error::*;

const DGRAM_BUF: usize = 4096;
const STREAM_BUF: usize = 4096;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

fn ret_to_err(val: isize) -> Result<Option<usize>> {
	match TryInto::<usize>::try_into(val) {
		Ok(n) => Ok(Some(n)),
		Err(_) => {
			let err = io::Error::last_os_error();

			if matches!(err.kind(), ErrorKind::WouldBlock) {
				return Ok(None);
			}

			error!("I/O operation failed: {err}");
			Err(())
		}
	}
}

fn send_raw(fd: RawFd, buf: &[u8]) -> Result<bool> {
	let r = unsafe { sys::send(fd, buf.as_ptr() as *mut BufType, buf.len() as _, 0) };

	if let Some(n) = ret_to_err(r as _)? {
		if n != buf.len() {
			error!("Only sent {}/{} bytes to socket", n, buf.len());
			return Err(());
		}

		Ok(true)
	} else {
		Ok(false)
	}
}

fn recv_raw(fd: RawFd, buf: &mut [u8]) -> Result<Option<usize>> {
	let r = unsafe { sys::recv(fd, buf.as_mut_ptr() as *mut BufType, buf.len() as _, 0) };
	ret_to_err(r as _)
}

/// How a registered socket's incoming bytes are split into frames.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
	/// Each successful `recv()` is one frame (UDP semantics).
	Datagram,
	/// Incoming bytes accumulate and are split on `\n`; used for the
	/// newline-framed JSON command/event sockets of C8.
	Lines,
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new(),
		})
	};
}

enum Entry {
	Conn {
		fwd: Fwd<Vec<u8>>,
		queue: VecDeque<Box<[u8]>>,
		mode: FrameMode,
		acc: Vec<u8>,
		/// Whether this socket's peer disconnecting is routine (an accepted
		/// client connection) rather than fatal (the TUN device, the
		/// upstream DNS socket, or a listener). Closable entries are simply
		/// deregistered on hangup instead of aborting the whole reactor.
		closable: bool,
	},
	Accept {
		fwd: Fwd<RawFd>,
	},
}

struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	/// Returns whether any more I/O is waiting.
	fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	/// Poll the fds. Returns whether any file descriptors are ready for I/O.
	fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("Fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		let mut pending: u32 = ret.try_into().map_err(|_| error!("poll() failed: {}", io::Error::last_os_error()))?;

		if pending == 0 {
			return Ok(false);
		}

		let mut to_close = Vec::new();

		for idx in 0..self.fds.len() {
			let Poll { fd, events, revents } = &mut self.fds[idx];
			let fd = *fd;

			if *revents == 0 {
				continue;
			}

			if *revents & (POLLERR | POLLHUP | POLLNVAL) != 0 {
				if self.is_closable(idx) {
					to_close.push(idx);
					pending -= 1;
					continue;
				}

				error!("Fatal socket condition on fd {fd} (revents={revents:#x})");
				return Err(());
			}

			if *revents & POLLIN != 0 {
				if self.flush_read(idx, fd)? {
					to_close.push(idx);
					pending -= 1;
					continue;
				}
			}

			if *revents & POLLOUT != 0 {
				self.flush_write(idx, fd)?;
			}

			if let Some(Poll { events, .. }) = self.fds.get_mut(idx) {
				*events = POLLIN;

				if let Some(Entry::Conn { queue, .. }) = self.entries.get(idx) {
					if !queue.is_empty() {
						*events |= POLLOUT;
					}
				}
			}

			pending -= 1;

			if pending == 0 {
				break;
			}
		}

		for Poll { revents, .. } in &mut self.fds {
			*revents = 0;
		}

		to_close.sort_unstable();
		for idx in to_close.into_iter().rev() {
			self.fds.swap_remove(idx);
			self.entries.swap_remove(idx);
		}

		Ok(true)
	}

	fn is_closable(&self, idx: usize) -> bool {
		matches!(self.entries.get(idx), Some(Entry::Conn { closable: true, .. }))
	}

	/// Reads everything currently available on `fd`. Returns whether the
	/// peer has closed a closable connection (the caller then deregisters
	/// `idx`); a non-closable peer closing is reported as a hard error.
	fn flush_read(&mut self, idx: usize, fd: RawFd) -> Result<bool> {
		match &mut self.entries[idx] {
			Entry::Accept { fwd } => {
				let fwd = fwd.clone();
				loop {
					let r = unsafe { sys::accept(fd, core::ptr::null_mut(), core::ptr::null_mut()) };
					match ret_to_err(r as isize) {
						Ok(Some(_)) => fwd.fwd(r as RawFd),
						Ok(None) => break,
						Err(()) => break,
					}
				}
				Ok(false)
			}
			Entry::Conn { fwd, mode, acc, closable, .. } => {
				let mut buf = [0u8; STREAM_BUF];

				loop {
					match recv_raw(fd, &mut buf)? {
						None => break,
						Some(0) => {
							if *closable {
								return Ok(true);
							}
							error!("Peer closed connection on fd {fd}");
							return Err(());
						}
						Some(n) => match mode {
							FrameMode::Datagram => fwd.fwd(buf[..n].to_vec()),
							FrameMode::Lines => {
								acc.extend_from_slice(&buf[..n]);

								while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
									let line: Vec<u8> = acc.drain(..=pos).collect();
									fwd.fwd(line[..line.len() - 1].to_vec());
								}
							}
						},
					}
				}

				Ok(false)
			}
		}
	}

	fn flush_write(&mut self, idx: usize, fd: RawFd) -> Result {
		let Entry::Conn { queue, .. } = &mut self.entries[idx] else {
			return Ok(());
		};

		assert!(!queue.is_empty());

		loop {
			let Some(buf) = queue.back_mut() else { return Ok(()) };

			if !send_raw(fd, buf)? {
				return Ok(());
			}

			queue.pop_back();
		}
	}
}

/// A registered socket that delivers whole frames (datagrams, or
/// newline-delimited lines for stream sockets) via `Fwd<Vec<u8>>`.
pub struct Io<T: AsRawFd> {
	inner: T,
	mode: FrameMode,
}

impl<T: AsRawFd> Io<T> {
	pub fn new(inner: T, mode: FrameMode, fwd: Fwd<Vec<u8>>) -> Self {
		Self::register(inner, mode, fwd, false)
	}

	/// Like `new`, but the peer disconnecting is treated as routine: the
	/// socket is quietly deregistered instead of aborting the reactor. For
	/// an accepted client connection (C8's command/event sockets) rather
	/// than a fixed, always-up peer.
	pub fn new_closable(inner: T, mode: FrameMode, fwd: Fwd<Vec<u8>>) -> Self {
		Self::register(inner, mode, fwd, true)
	}

	fn register(inner: T, mode: FrameMode, fwd: Fwd<Vec<u8>>, closable: bool) -> Self {
		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });
			i.entries.push(Entry::Conn { fwd, queue: VecDeque::new(), mode, acc: Vec::new(), closable });
			Self { inner, mode }
		})
	}

	pub fn mode(&self) -> FrameMode {
		self.mode
	}

	/// False once a closable peer has disconnected and `poll()` has reaped
	/// its reactor entry. Always true for non-closable sockets until dropped.
	pub fn is_registered(&self) -> bool {
		let fd = as_raw(&self.inner);
		State::with(|i| i.fds.iter().any(|f| f.fd == fd))
	}

	/// Direct access to the wrapped socket, for protocols (like the DNS
	/// upstream forwarder) that need their own `send_to`/`recv_from` rather
	/// than the connected-peer `write()` below.
	pub fn inner(&self) -> &T {
		&self.inner
	}

	/// Queues `bytes` for sending. `Lines` mode appends a trailing `\n`.
	pub fn write(&self, bytes: &[u8]) -> Result {
		let mut owned = bytes.to_vec();

		if self.mode == FrameMode::Lines {
			owned.push(b'\n');
		}

		if !send_raw(as_raw(&self.inner), &owned)? {
			State::with(|i| {
				// Absent if a closable peer already disconnected and was
				// reaped by `poll()`; the write is simply dropped.
				let Some(idx) = i.fds.iter().position(|f| f.fd == as_raw(&self.inner)) else {
					return;
				};
				if let Entry::Conn { queue, .. } = &mut i.entries[idx] {
					queue.push_front(owned.into_boxed_slice());
				}
				i.fds[idx].events |= POLLOUT;
			});
		}

		Ok(())
	}
}

impl<T: AsRawFd> Drop for Io<T> {
	fn drop(&mut self) {
		let fd = as_raw(&self.inner);

		State::with(|i| {
			if let Some(idx) = i.fds.iter().position(|f| f.fd == fd) {
				i.entries.swap_remove(idx);
				i.fds.swap_remove(idx);
			}
		})
	}
}

/// A registered listening socket that forwards each accepted connection's
/// raw descriptor via `Fwd<RawFd>`. The caller wraps the descriptor in an
/// `Io<_>` (constructed from the platform-specific socket type) to start
/// reading frames from it.
pub struct Listener<T: AsRawFd> {
	inner: T,
}

impl<T: AsRawFd> Listener<T> {
	pub fn new(inner: T, fwd: Fwd<RawFd>) -> Self {
		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });
			i.entries.push(Entry::Accept { fwd });
			Self { inner }
		})
	}
}

impl<T: AsRawFd> Drop for Listener<T> {
	fn drop(&mut self) {
		let fd = as_raw(&self.inner);

		State::with(|i| {
			if let Some(idx) = i.fds.iter().position(|f| f.fd == fd) {
				i.entries.swap_remove(idx);
				i.fds.swap_remove(idx);
			}
		})
	}
}
