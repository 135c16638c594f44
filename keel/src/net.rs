// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Non-blocking TCP integrated with the fiber scheduler.
//!
//! Reads and writes suspend the calling fiber on the waiter instead of
//! blocking the thread. DNS resolution happens on a helper thread. A
//! listener dispatches each accepted connection to the supplied handler on
//! a fresh fiber.
//!
//! TLS itself is an external engine; the socket carries its configuration
//! (certificates, ciphers, verification flags) for that engine to consume.

use bitflags::bitflags;
use core::cell::{Cell, RefCell};
use core::fmt;
use std::io::{Read as _, Write as _};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::rerror;
use crate::runtime::Runtime;
use crate::thread::spawn_thread;
use crate::time::{Ticks, ticks};
use crate::wait::{Ready, Wait};

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct SocketFlags: u32 {
        const CLOSED = 1 << 0;
        const EOF = 1 << 1;
        const LISTENER = 1 << 2;
        const SERVER = 1 << 3;
        const CERT = 1 << 4;
    }
}

/// TLS material handed to the external TLS engine.
#[derive(Clone, Debug)]
pub struct SocketConfig {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ciphers: Option<String>,
    pub verify_peer: bool,
    pub verify_issuer: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            ca: None,
            cert: None,
            key: None,
            ciphers: None,
            verify_peer: true,
            verify_issuer: true,
        }
    }
}

static DEFAULT_CONFIG: Mutex<Option<SocketConfig>> = Mutex::new(None);

/// Install process-wide default TLS material applied to new sockets.
pub fn set_default_certs(config: SocketConfig) {
    *DEFAULT_CONFIG.lock().expect("socket defaults poisoned") = Some(config);
}

struct SocketInner {
    rt: Runtime,
    stream: RefCell<Option<mio::net::TcpStream>>,
    listener: RefCell<Option<mio::net::TcpListener>>,
    wait: RefCell<Option<Rc<Wait>>>,
    flags: Cell<SocketFlags>,
    activity: Cell<Ticks>,
    config: RefCell<SocketConfig>,
}

/// A non-blocking TCP endpoint. Cheap to clone; clones share the
/// connection.
#[derive(Clone)]
pub struct Socket {
    inner: Rc<SocketInner>,
}

impl Socket {
    #[must_use]
    pub fn new(rt: &Runtime) -> Self {
        let config = DEFAULT_CONFIG
            .lock()
            .expect("socket defaults poisoned")
            .clone()
            .unwrap_or_default();
        Self {
            inner: Rc::new(SocketInner {
                rt: rt.clone(),
                stream: RefCell::new(None),
                listener: RefCell::new(None),
                wait: RefCell::new(None),
                flags: Cell::new(SocketFlags::empty()),
                activity: Cell::new(ticks()),
                config: RefCell::new(config),
            }),
        }
    }

    fn accepted(rt: &Runtime, mut stream: mio::net::TcpStream) -> Result<Self> {
        let wait = Rc::new(rt.alloc_wait(&mut stream)?);
        let sock = Self::new(rt);
        sock.inner.flags.set(SocketFlags::SERVER);
        *sock.inner.stream.borrow_mut() = Some(stream);
        *sock.inner.wait.borrow_mut() = Some(wait);
        Ok(sock)
    }

    fn flag(&self, flag: SocketFlags) -> bool {
        self.inner.flags.get().contains(flag)
    }

    fn raise(&self, flag: SocketFlags) {
        self.inner.flags.set(self.inner.flags.get() | flag);
    }

    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.flag(SocketFlags::EOF)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.flag(SocketFlags::CLOSED)
    }

    #[must_use]
    pub fn is_listener(&self) -> bool {
        self.flag(SocketFlags::LISTENER)
    }

    /// True for the accepted side of a connection.
    #[must_use]
    pub fn is_server_side(&self) -> bool {
        self.flag(SocketFlags::SERVER)
    }

    #[must_use]
    pub fn has_cert(&self) -> bool {
        self.flag(SocketFlags::CERT)
    }

    /// Tick of the last successful read or write.
    #[must_use]
    pub fn activity(&self) -> Ticks {
        self.inner.activity.get()
    }

    fn wait_handle(&self) -> Result<Rc<Wait>> {
        self.inner
            .wait
            .borrow()
            .clone()
            .ok_or(Error::NotConnected)
    }

    // === connect / listen ===

    /// Connect to `host:port`. Resolution runs on a helper thread; the
    /// fiber then suspends until the connection is writable or the
    /// absolute `deadline` passes.
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] when already connected or listening,
    /// [`Error::CantResolve`], [`Error::Timeout`], [`Error::CantConnect`].
    pub async fn connect(&self, host: &str, port: u16, deadline: Ticks) -> Result<()> {
        if self.inner.stream.borrow().is_some() || self.is_listener() {
            return Err(Error::BadState);
        }
        let addr = resolve(&self.inner.rt, host, port).await?;
        let mut stream = mio::net::TcpStream::connect(addr).map_err(|_| Error::CantConnect)?;
        let wait = Rc::new(self.inner.rt.alloc_wait(&mut stream)?);
        self.inner
            .flags
            .set(self.inner.flags.get() - (SocketFlags::CLOSED | SocketFlags::EOF));
        *self.inner.stream.borrow_mut() = Some(stream);
        *self.inner.wait.borrow_mut() = Some(wait.clone());

        let mask = wait.wait_for_io(Ready::WRITABLE, deadline).await?;
        if mask.contains(Ready::TIMEOUT) {
            self.reset();
            return Err(Error::Timeout);
        }
        if mask.is_empty() {
            self.reset();
            return Err(Error::CantConnect);
        }
        let verdict = {
            let stream = self.inner.stream.borrow();
            match stream.as_ref() {
                Some(stream) => match stream.take_error() {
                    Ok(None) => stream.peer_addr().map(|_| ()),
                    Ok(Some(err)) => Err(err),
                    Err(err) => Err(err),
                },
                None => return Err(Error::CantConnect),
            }
        };
        if verdict.is_err() {
            self.reset();
            return Err(Error::CantConnect);
        }
        self.inner.activity.set(ticks());
        Ok(())
    }

    /// Bind and listen; each accepted connection runs `handler` on a new
    /// fiber. A `None` host binds all interfaces. Returns the bound port.
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] when already in use, [`Error::CantResolve`] for
    /// an unresolvable host, [`Error::CantOpen`] when binding fails.
    pub fn listen<H, Fut>(&self, host: Option<&str>, port: u16, handler: H) -> Result<u16>
    where
        H: Fn(Socket) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        if self.inner.stream.borrow().is_some()
            || self.inner.listener.borrow().is_some()
            || self.is_closed()
        {
            return Err(Error::BadState);
        }
        let addr = match host {
            None | Some("") => SocketAddr::from(([0, 0, 0, 0], port)),
            Some(host) => match host.parse::<IpAddr>() {
                Ok(ip) => SocketAddr::new(ip, port),
                Err(_) => (host, port)
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.next())
                    .ok_or(Error::CantResolve)?,
            },
        };
        let mut listener = mio::net::TcpListener::bind(addr).map_err(|_| Error::CantOpen)?;
        let bound = listener.local_addr().map_err(|_| Error::CantOpen)?.port();
        let wait = Rc::new(self.inner.rt.alloc_wait(&mut listener)?);
        self.raise(SocketFlags::LISTENER);
        *self.inner.listener.borrow_mut() = Some(listener);
        *self.inner.wait.borrow_mut() = Some(wait.clone());

        let this = self.clone();
        let handler = Rc::new(handler);
        wait.set_handler(Ready::READABLE, 0, move |_bits| {
            let this = this.clone();
            let handler = handler.clone();
            async move {
                loop {
                    let accepted = {
                        let listener = this.inner.listener.borrow();
                        match listener.as_ref() {
                            Some(listener) => listener.accept(),
                            None => break,
                        }
                    };
                    match accepted {
                        Ok((stream, _peer)) => {
                            match Socket::accepted(&this.inner.rt, stream) {
                                Ok(sock) => {
                                    let conn = handler(sock);
                                    if let Err(err) =
                                        this.inner.rt.spawn_fiber("socket", conn)
                                    {
                                        rerror!("socket", "cannot spawn handler: {err}");
                                    }
                                }
                                Err(err) => {
                                    rerror!("socket", "cannot register accepted: {err}");
                                }
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            rerror!("socket", "accept failed: {err}");
                            break;
                        }
                    }
                }
            }
        });
        Ok(bound)
    }

    // === read / write ===

    /// Read into `buf`, suspending until data, EOF, cancellation or the
    /// absolute `deadline`. `Ok(0)` with [`Self::is_eof`] set means the
    /// peer closed (or the wait was cancelled).
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] on a closed socket, [`Error::NotConnected`],
    /// [`Error::Timeout`], or the mapped I/O error.
    pub async fn read(&self, buf: &mut [u8], deadline: Ticks) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.is_closed() {
                return Err(Error::BadState);
            }
            let attempted = {
                let stream = self.inner.stream.borrow();
                let Some(stream) = stream.as_ref() else {
                    return Err(Error::NotConnected);
                };
                let mut stream = stream;
                stream.read(buf)
            };
            match attempted {
                Ok(0) => {
                    self.raise(SocketFlags::EOF);
                    return Ok(0);
                }
                Ok(n) => {
                    self.inner.activity.set(ticks());
                    return Ok(n);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
            let wait = self.wait_handle()?;
            let mask = wait.wait_for_io(Ready::READABLE, deadline).await?;
            if mask.contains(Ready::TIMEOUT) {
                return Err(Error::Timeout);
            }
            if mask.is_empty() {
                // Cancelled or closed underneath us; observed as EOF.
                self.raise(SocketFlags::EOF);
                return Ok(0);
            }
        }
    }

    /// Write all of `buf`, suspending as needed. Returns the bytes
    /// written: the full length, or the partial count when the deadline
    /// passes after progress was made.
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] on a closed socket, [`Error::NotConnected`],
    /// [`Error::Timeout`] when nothing could be written in time,
    /// [`Error::CantWrite`] when the connection went away mid-write.
    pub async fn write(&self, buf: &[u8], deadline: Ticks) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            if self.is_closed() {
                return Err(Error::BadState);
            }
            let attempted = {
                let stream = self.inner.stream.borrow();
                let Some(stream) = stream.as_ref() else {
                    return Err(Error::NotConnected);
                };
                let mut stream = stream;
                stream.write(&buf[written..])
            };
            match attempted {
                Ok(n) => {
                    written += n;
                    self.inner.activity.set(ticks());
                    continue;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
            let wait = self.wait_handle()?;
            let mask = wait.wait_for_io(Ready::WRITABLE, deadline).await?;
            if mask.contains(Ready::TIMEOUT) {
                if written > 0 {
                    return Ok(written);
                }
                return Err(Error::Timeout);
            }
            if mask.is_empty() {
                return Err(Error::CantWrite);
            }
        }
        Ok(written)
    }

    // === lifecycle ===

    /// Close, waking any fiber blocked on this socket. Idempotent: a
    /// second close returns with no observable change.
    pub fn close(&self) {
        if self.flag(SocketFlags::CLOSED) {
            return;
        }
        self.raise(SocketFlags::CLOSED | SocketFlags::EOF);
        self.teardown();
    }

    /// Close the descriptor but keep the object (and its TLS
    /// configuration) for a later [`Self::connect`].
    pub fn reset(&self) {
        self.teardown();
        self.inner
            .flags
            .set(self.inner.flags.get() & SocketFlags::CERT);
    }

    fn teardown(&self) {
        let wait = self.inner.wait.borrow_mut().take();
        let stream = self.inner.stream.borrow_mut().take();
        let listener = self.inner.listener.borrow_mut().take();
        if let Some(mut stream) = stream {
            if let Some(wait) = &wait {
                wait.free(&mut stream);
            }
            let _ = stream.shutdown(std::net::Shutdown::Both);
        } else if let Some(mut listener) = listener {
            if let Some(wait) = &wait {
                wait.free(&mut listener);
            }
        }
        drop(wait);
    }

    /// Local address as `(ip, port)`.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] without a descriptor.
    pub fn local_addr(&self) -> Result<(String, u16)> {
        let addr = if let Some(stream) = self.inner.stream.borrow().as_ref() {
            stream.local_addr().map_err(|_| Error::NotConnected)?
        } else if let Some(listener) = self.inner.listener.borrow().as_ref() {
            listener.local_addr().map_err(|_| Error::NotConnected)?
        } else {
            return Err(Error::NotConnected);
        };
        Ok((addr.ip().to_string(), addr.port()))
    }

    /// Peer address as `(ip, port)`.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] without a connected stream.
    pub fn peer_addr(&self) -> Result<(String, u16)> {
        let stream = self.inner.stream.borrow();
        let stream = stream.as_ref().ok_or(Error::NotConnected)?;
        let addr = stream.peer_addr().map_err(|_| Error::NotConnected)?;
        Ok((addr.ip().to_string(), addr.port()))
    }

    // === TLS configuration (consumed by the external TLS engine) ===

    pub fn set_certs(&self, ca: Option<&str>, cert: Option<&str>, key: Option<&str>) {
        let mut config = self.inner.config.borrow_mut();
        config.ca = ca.map(str::to_string);
        config.cert = cert.map(str::to_string);
        config.key = key.map(str::to_string);
        drop(config);
        self.raise(SocketFlags::CERT);
    }

    pub fn set_ciphers(&self, ciphers: &str) {
        self.inner.config.borrow_mut().ciphers = Some(ciphers.to_string());
    }

    pub fn set_verify(&self, peer: bool, issuer: bool) {
        let mut config = self.inner.config.borrow_mut();
        config.verify_peer = peer;
        config.verify_issuer = issuer;
    }

    #[must_use]
    pub fn config(&self) -> SocketConfig {
        self.inner.config.borrow().clone()
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("flags", &self.inner.flags.get())
            .field("activity", &self.inner.activity.get())
            .finish()
    }
}

async fn resolve(rt: &Runtime, host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let host = host.to_string();
    let addrs = spawn_thread(rt, "dns", move || {
        (host.as_str(), port)
            .to_socket_addrs()
            .map(|addrs| addrs.collect::<Vec<_>>())
    })
    .await?;
    addrs
        .ok()
        .and_then(|addrs| addrs.into_iter().next())
        .ok_or(Error::CantResolve)
}

/// Crude reachability heuristic: can a TCP connection leave the host?
pub async fn check_internet(rt: &Runtime) -> bool {
    let sock = Socket::new(rt);
    let ok = sock.connect("8.8.8.8", 53, ticks() + 2000).await.is_ok();
    sock.close();
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::Buf;
    use crate::fiber;
    use crate::test_util::with_runtime;
    use crate::time::sleep;

    const DEADLINE: Ticks = 10_000;

    fn line() -> Vec<u8> {
        let mut line = Vec::new();
        line.extend_from_slice(b"abcdefghijklmnopqrstuvwxyz");
        line.extend_from_slice(b"ABCDEFGHIJKLMNOPQRSTUVWXY");
        line.push(b'\n');
        assert_eq!(line.len(), 52);
        line
    }

    // Scenario: loopback echo of 500 000 bytes, byte-identical across
    // however many reads it takes.
    #[test]
    fn loopback_stream_is_byte_identical() {
        with_runtime(|rt| async move {
            const TOTAL: usize = 500_000;
            let root = fiber::current_fiber().unwrap();

            let server = Socket::new(&rt);
            let port = server
                .listen(Some("127.0.0.1"), 0, move |conn| {
                    let root = root.clone();
                    async move {
                        let mut collected = Buf::with_capacity(TOTAL);
                        let mut chunk = [0_u8; 16 * 1024];
                        loop {
                            let n = conn.read(&mut chunk, ticks() + DEADLINE).await.unwrap();
                            if n == 0 {
                                assert!(conn.is_eof());
                                break;
                            }
                            collected.put(&chunk[..n]).unwrap();
                        }
                        conn.close();
                        root.resume(collected.into_string().unwrap().into_bytes())
                            .unwrap();
                    }
                })
                .unwrap();

            let mut payload = Vec::with_capacity(TOTAL + 52);
            while payload.len() < TOTAL {
                payload.extend_from_slice(&line());
            }
            payload.truncate(TOTAL);

            let client = Socket::new(&rt);
            client
                .connect("127.0.0.1", port, ticks() + DEADLINE)
                .await
                .unwrap();
            let sent = client.write(&payload, ticks() + DEADLINE).await.unwrap();
            assert_eq!(sent, TOTAL);
            client.close();

            let received = fiber::suspend(()).await.unwrap();
            let received = *received.downcast::<Vec<u8>>().unwrap();
            assert_eq!(received.len(), TOTAL);
            assert_eq!(received, payload);
            server.close();
        });
    }

    // Property 10: close is idempotent.
    #[test]
    fn close_is_idempotent() {
        with_runtime(|rt| async move {
            let server = Socket::new(&rt);
            let port = server
                .listen(Some("127.0.0.1"), 0, |conn| async move {
                    let _ = conn.read(&mut [0_u8; 16], 0).await;
                })
                .unwrap();
            let client = Socket::new(&rt);
            client
                .connect("127.0.0.1", port, ticks() + DEADLINE)
                .await
                .unwrap();

            client.close();
            assert!(client.is_closed());
            assert!(client.is_eof());
            let flags = client.inner.flags.get();
            client.close();
            assert_eq!(client.inner.flags.get(), flags);
            server.close();
        });
    }

    #[test]
    fn read_deadline_returns_timeout() {
        with_runtime(|rt| async move {
            let server = Socket::new(&rt);
            let port = server
                .listen(Some("127.0.0.1"), 0, |conn| async move {
                    // Hold the connection open without writing.
                    sleep(&crate::runtime::current().unwrap(), 500).await;
                    conn.close();
                })
                .unwrap();
            let client = Socket::new(&rt);
            client
                .connect("127.0.0.1", port, ticks() + DEADLINE)
                .await
                .unwrap();
            let mut buf = [0_u8; 8];
            let got = client.read(&mut buf, ticks() + 50).await;
            assert_eq!(got, Err(Error::Timeout));
            client.close();
            server.close();
        });
    }

    #[test]
    fn connect_refused_errors() {
        with_runtime(|rt| async move {
            // Bind a port, then close the listener so the port is dead.
            let probe = Socket::new(&rt);
            let port = probe.listen(Some("127.0.0.1"), 0, |_| async {}).unwrap();
            probe.close();
            sleep(&rt, 10).await;

            let client = Socket::new(&rt);
            let got = client.connect("127.0.0.1", port, ticks() + 2000).await;
            assert!(matches!(got, Err(Error::CantConnect) | Err(Error::Timeout)));
        });
    }

    #[test]
    fn resolve_failure_is_reported() {
        with_runtime(|rt| async move {
            let client = Socket::new(&rt);
            let got = client
                .connect("no-such-host.invalid", 80, ticks() + 5000)
                .await;
            assert_eq!(got, Err(Error::CantResolve));
        });
    }

    #[test]
    fn reset_allows_reconnect() {
        with_runtime(|rt| async move {
            let server = Socket::new(&rt);
            let port = server
                .listen(Some("127.0.0.1"), 0, |conn| async move {
                    let mut buf = [0_u8; 4];
                    let _ = conn.read(&mut buf, 0).await;
                    conn.close();
                })
                .unwrap();

            let client = Socket::new(&rt);
            client
                .connect("127.0.0.1", port, ticks() + DEADLINE)
                .await
                .unwrap();
            client.reset();
            assert!(!client.is_closed());
            client
                .connect("127.0.0.1", port, ticks() + DEADLINE)
                .await
                .unwrap();
            let (ip, _port) = client.peer_addr().unwrap();
            assert_eq!(ip, "127.0.0.1");
            client.close();
            server.close();
        });
    }

    #[test]
    fn tls_configuration_is_carried() {
        with_runtime(|rt| async move {
            let sock = Socket::new(&rt);
            assert!(!sock.has_cert());
            sock.set_certs(Some("ca.pem"), Some("cert.pem"), Some("key.pem"));
            sock.set_ciphers("TLS_AES_128_GCM_SHA256");
            sock.set_verify(true, false);
            assert!(sock.has_cert());
            let config = sock.config();
            assert_eq!(config.ca.as_deref(), Some("ca.pem"));
            assert_eq!(config.ciphers.as_deref(), Some("TLS_AES_128_GCM_SHA256"));
            assert!(config.verify_peer);
            assert!(!config.verify_issuer);
        });
    }
}
