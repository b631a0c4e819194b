// EGL remote viewer protocol
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Display export to out-of-process viewers over a Unix socket.
//!
//! Every message is 28 bytes. Buffers are announced with `NEWBUF`, which
//! carries the dma-buf of the display as `SCM_RIGHTS` ancillary data; the
//! viewer answers with input events and `DRAW_DONE` once a frame is on
//! screen.

use std::{
    fs::{self, File, Permissions},
    io::{self, Read, Write},
    os::{
        fd::{AsRawFd, OwnedFd},
        unix::{
            fs::PermissionsExt,
            net::{UnixListener, UnixStream},
        },
    },
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use thiserror::Error as ThisError;
use vm_memory::{ByteValued, Le32};
use vmm_sys_util::sock_ctrl_msg::ScmSocket;

pub const EGL_MSG_SIZE: usize = 28;

pub const EGL_NEWBUF: u32 = 100;
pub const EGL_UPDATE: u32 = 101;
pub const EGL_POINTER_SET: u32 = 102;

pub const EGL_MOTION: u32 = 200;
pub const EGL_BUTTON_PRESS: u32 = 201;
pub const EGL_BUTTON_RELEASE: u32 = 202;
pub const EGL_KEY_PRESS: u32 = 203;
pub const EGL_KEY_RELEASE: u32 = 204;
pub const EGL_DRAW_DONE: u32 = 205;

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Failed to create viewer socket {}: {1}", .0.display())]
    Bind(PathBuf, io::Error),
    #[error("Failed to connect to viewer socket {}: {1}", .0.display())]
    Connect(PathBuf, io::Error),
    #[error("Viewer socket I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Unknown message type {0}")]
    UnknownType(u32),
    #[error("Short message: {0} of 28 bytes")]
    ShortMessage(usize),
    #[error("Peer closed the connection")]
    Disconnected,
    #[error("No such display {0}")]
    InvalidDisplay(u32),
}

/// Path of the listening socket for the VM called `name`.
pub fn socket_path(name: Option<&str>) -> PathBuf {
    PathBuf::from(format!("/tmp/qemu-egl-sock-{}", name.unwrap_or("noname")))
}

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
struct egl_msg {
    type_: Le32,
    display: Le32,
    u: [Le32; 5],
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for egl_msg {}

/// Layout of a display buffer as announced by `NEWBUF`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferDesc {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub fourcc: u32,
    pub y0_top: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EglMsg {
    NewBuf { display: u32, buf: BufferDesc },
    Update { display: u32 },
    PointerSet { display: u32, x: u32, y: u32, on: bool },
    Motion { display: u32, x: u32, y: u32, w: u32, h: u32 },
    ButtonPress { display: u32, button: u32 },
    ButtonRelease { display: u32, button: u32 },
    KeyPress { display: u32, keycode: u32 },
    KeyRelease { display: u32, keycode: u32 },
    DrawDone { display: u32 },
}

impl EglMsg {
    pub const fn display(&self) -> u32 {
        match *self {
            Self::NewBuf { display, .. }
            | Self::Update { display }
            | Self::PointerSet { display, .. }
            | Self::Motion { display, .. }
            | Self::ButtonPress { display, .. }
            | Self::ButtonRelease { display, .. }
            | Self::KeyPress { display, .. }
            | Self::KeyRelease { display, .. }
            | Self::DrawDone { display } => display,
        }
    }

    pub fn encode(&self) -> [u8; EGL_MSG_SIZE] {
        let (type_, u) = match *self {
            Self::NewBuf { buf, .. } => (
                EGL_NEWBUF,
                [
                    buf.width,
                    buf.height,
                    buf.stride,
                    buf.fourcc,
                    u32::from(buf.y0_top),
                ],
            ),
            Self::Update { .. } => (EGL_UPDATE, [0; 5]),
            Self::PointerSet { x, y, on, .. } => (EGL_POINTER_SET, [x, y, u32::from(on), 0, 0]),
            Self::Motion { x, y, w, h, .. } => (EGL_MOTION, [x, y, w, h, 0]),
            Self::ButtonPress { button, .. } => (EGL_BUTTON_PRESS, [button, 0, 0, 0, 0]),
            Self::ButtonRelease { button, .. } => (EGL_BUTTON_RELEASE, [button, 0, 0, 0, 0]),
            Self::KeyPress { keycode, .. } => (EGL_KEY_PRESS, [keycode, 0, 0, 0, 0]),
            Self::KeyRelease { keycode, .. } => (EGL_KEY_RELEASE, [keycode, 0, 0, 0, 0]),
            Self::DrawDone { .. } => (EGL_DRAW_DONE, [0; 5]),
        };

        let msg = egl_msg {
            type_: type_.into(),
            display: self.display().into(),
            u: u.map(Le32::from),
        };
        let mut out = [0u8; EGL_MSG_SIZE];
        out.copy_from_slice(msg.as_slice());
        out
    }

    pub fn decode(bytes: &[u8; EGL_MSG_SIZE]) -> Result<Self> {
        let mut msg = egl_msg::default();
        msg.as_mut_slice().copy_from_slice(bytes);
        let display = msg.display.to_native();
        let u = msg.u.map(|v| v.to_native());

        Ok(match msg.type_.to_native() {
            EGL_NEWBUF => Self::NewBuf {
                display,
                buf: BufferDesc {
                    width: u[0],
                    height: u[1],
                    stride: u[2],
                    fourcc: u[3],
                    // C bool at offset 24.
                    y0_top: (u[4] & 0xff) != 0,
                },
            },
            EGL_UPDATE => Self::Update { display },
            EGL_POINTER_SET => Self::PointerSet {
                display,
                x: u[0],
                y: u[1],
                on: u[2] != 0,
            },
            EGL_MOTION => Self::Motion {
                display,
                x: u[0],
                y: u[1],
                w: u[2],
                h: u[3],
            },
            EGL_BUTTON_PRESS => Self::ButtonPress {
                display,
                button: u[0],
            },
            EGL_BUTTON_RELEASE => Self::ButtonRelease {
                display,
                button: u[0],
            },
            EGL_KEY_PRESS => Self::KeyPress {
                display,
                keycode: u[0],
            },
            EGL_KEY_RELEASE => Self::KeyRelease {
                display,
                keycode: u[0],
            },
            EGL_DRAW_DONE => Self::DrawDone { display },
            other => return Err(Error::UnknownType(other)),
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

impl MouseButton {
    fn from_viewer(button: u32) -> Option<Self> {
        match button {
            1 => Some(Self::Left),
            2 => Some(Self::Middle),
            3 => Some(Self::Right),
            _ => None,
        }
    }
}

/// The console the viewers drive: input events and GL frame pacing.
pub trait ConsoleSink {
    /// Absolute pointer position `value` within `size` on `axis`.
    fn input_abs(&mut self, axis: Axis, value: u32, size: u32);
    fn input_button(&mut self, button: MouseButton, pressed: bool);
    fn input_key(&mut self, keycode: u32, pressed: bool);
    fn input_sync(&mut self);
    /// Holds back (or releases) the GL producer until the viewer drew.
    fn gl_block(&mut self, block: bool);
}

#[derive(Debug, Default)]
struct EglDisplay {
    updates: u32,
    buffer: Option<(BufferDesc, OwnedFd)>,
}

impl EglDisplay {
    fn newbuf(&self, idx: u32) -> Option<(EglMsg, &OwnedFd)> {
        self.buffer.as_ref().map(|(buf, fd)| {
            (
                EglMsg::NewBuf {
                    display: idx,
                    buf: *buf,
                },
                fd,
            )
        })
    }
}

fn send_one(stream: &UnixStream, msg: &EglMsg, fd: Option<&OwnedFd>) -> io::Result<()> {
    let bytes = msg.encode();
    let sent = match fd {
        Some(fd) => stream
            .send_with_fd(&bytes[..], fd.as_raw_fd())
            .map_err(io::Error::from)?,
        None => (&*stream).write(&bytes)?,
    };
    if sent != EGL_MSG_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("sent {sent} of {EGL_MSG_SIZE} bytes"),
        ));
    }
    Ok(())
}

/// Listening side: exports the displays to every connected viewer.
#[derive(Debug)]
pub struct EglServer {
    path: PathBuf,
    listener: UnixListener,
    clients: Vec<UnixStream>,
    displays: Vec<EglDisplay>,
}

impl EglServer {
    /// Listens on `path` for viewers of `num_displays` displays.
    pub fn bind<P: AsRef<Path>>(path: P, num_displays: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                return Err(Error::Bind(path, e));
            }
            _ => (),
        }

        let listener = UnixListener::bind(&path).map_err(|e| Error::Bind(path.clone(), e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Bind(path.clone(), e))?;
        fs::set_permissions(&path, Permissions::from_mode(0o777))
            .map_err(|e| Error::Bind(path.clone(), e))?;
        info!("egl: listening on {}", path.display());

        Ok(Self {
            path,
            listener,
            clients: Vec::new(),
            displays: (0..num_displays).map(|_| EglDisplay::default()).collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    fn display_mut(&mut self, display: u32) -> Result<&mut EglDisplay> {
        self.displays
            .get_mut(display as usize)
            .ok_or(Error::InvalidDisplay(display))
    }

    /// Accepts every pending viewer and sends it the current buffer of each
    /// display. Returns the number of viewers accepted.
    pub fn accept(&mut self) -> Result<usize> {
        let mut accepted = 0;
        loop {
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(accepted),
                Err(e) => return Err(e.into()),
            };
            stream.set_nonblocking(true)?;
            accepted += 1;

            let mut alive = true;
            for (idx, display) in self.displays.iter().enumerate() {
                let Some((msg, fd)) = display.newbuf(idx as u32) else {
                    continue;
                };
                if let Err(e) = send_one(&stream, &msg, Some(fd)) {
                    warn!("egl: dropping new viewer: {e}");
                    alive = false;
                    break;
                }
            }
            if alive {
                debug!("egl: viewer {} connected", stream.as_raw_fd());
                self.clients.push(stream);
            }
        }
    }

    /// Sends `msg` to every viewer, dropping those that cannot take it.
    fn broadcast(&mut self, msg: &EglMsg, fd: Option<&OwnedFd>) {
        self.clients.retain(|stream| match send_one(stream, msg, fd) {
            Ok(()) => true,
            Err(e) => {
                warn!("egl: dropping viewer {}: {e}", stream.as_raw_fd());
                false
            }
        });
    }

    fn broadcast_newbuf(&mut self, display: u32) {
        let Some(egl_display) = self.displays.get_mut(display as usize) else {
            return;
        };
        // Take the buffer out while broadcasting so `self` can be borrowed.
        let buffer = egl_display.buffer.take();
        if let Some((buf, fd)) = &buffer {
            let msg = EglMsg::NewBuf { display, buf: *buf };
            self.broadcast(&msg, Some(fd));
        }
        self.displays[display as usize].buffer = buffer;
    }

    /// A new surface replaced the display's buffer.
    pub fn gfx_switch(&mut self, display: u32, buf: BufferDesc, fd: OwnedFd) -> Result<()> {
        info!(
            "egl: display {display}: {}x{} (stride {}, fourcc {:#x})",
            buf.width, buf.height, buf.stride, buf.fourcc
        );
        self.display_mut(display)?.buffer = Some((buf, fd));
        self.broadcast_newbuf(display);
        Ok(())
    }

    /// A GL texture is scanned out on the display. Empty scanouts are
    /// ignored.
    pub fn scanout(&mut self, display: u32, buf: BufferDesc, fd: OwnedFd) -> Result<()> {
        if buf.width == 0 || buf.height == 0 {
            return Ok(());
        }
        self.gfx_switch(display, buf, fd)
    }

    /// Records damage on the display; it is sent out on the next refresh.
    pub fn gfx_update(&mut self, display: u32) -> Result<()> {
        self.display_mut(display)?.updates += 1;
        Ok(())
    }

    pub fn refresh(&mut self, display: u32) -> Result<()> {
        let egl_display = self.display_mut(display)?;
        if egl_display.buffer.is_none() || egl_display.updates == 0 {
            return Ok(());
        }
        egl_display.updates = 0;
        self.broadcast(&EglMsg::Update { display }, None);
        Ok(())
    }

    pub fn mouse_set(&mut self, display: u32, x: u32, y: u32, on: bool) -> Result<()> {
        self.display_mut(display)?;
        self.broadcast(&EglMsg::PointerSet { display, x, y, on }, None);
        Ok(())
    }

    /// A GL frame is ready. The producer stays blocked until a viewer
    /// reports `DRAW_DONE`.
    pub fn scanout_flush(&mut self, display: u32, console: &mut dyn ConsoleSink) -> Result<()> {
        self.display_mut(display)?;
        if !self.clients.is_empty() {
            console.gl_block(true);
        }
        self.broadcast(&EglMsg::Update { display }, None);
        Ok(())
    }

    /// Drains the messages every viewer sent so far.
    pub fn read_clients(&mut self, console: &mut dyn ConsoleSink) {
        self.clients.retain(|stream| {
            let alive = read_client(stream, console);
            if !alive {
                console.gl_block(false);
                debug!("egl: viewer {} disconnected", stream.as_raw_fd());
            }
            alive
        });
    }
}

impl Drop for EglServer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// Returns false once the viewer is gone.
fn read_client(mut stream: &UnixStream, console: &mut dyn ConsoleSink) -> bool {
    loop {
        let mut bytes = [0u8; EGL_MSG_SIZE];
        match stream.read(&mut bytes) {
            Ok(EGL_MSG_SIZE) => (),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(_) | Err(_) => return false,
        }

        match EglMsg::decode(&bytes) {
            Ok(EglMsg::Motion { x, y, w, h, .. }) => {
                console.input_abs(Axis::X, x, w);
                console.input_abs(Axis::Y, y, h);
                console.input_sync();
            }
            Ok(EglMsg::ButtonPress { button, .. }) => button_event(console, button, true),
            Ok(EglMsg::ButtonRelease { button, .. }) => button_event(console, button, false),
            Ok(EglMsg::KeyPress { keycode, .. }) => console.input_key(keycode, true),
            Ok(EglMsg::KeyRelease { keycode, .. }) => console.input_key(keycode, false),
            Ok(EglMsg::DrawDone { .. }) => console.gl_block(false),
            Ok(msg) => warn!("egl: unexpected message from viewer: {msg:?}"),
            Err(e) => warn!("egl: {e}"),
        }
    }
}

fn button_event(console: &mut dyn ConsoleSink, button: u32, pressed: bool) {
    if let Some(button) = MouseButton::from_viewer(button) {
        console.input_button(button, pressed);
        console.input_sync();
    }
}

/// Viewer side of the socket.
#[derive(Debug)]
pub struct EglViewer {
    stream: UnixStream,
}

impl EglViewer {
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let stream =
            UnixStream::connect(path).map_err(|e| Error::Connect(path.to_path_buf(), e))?;
        Ok(Self { stream })
    }

    /// Waits for the next message and the file descriptor sent with it.
    pub fn recv(&self) -> Result<(EglMsg, Option<File>)> {
        let mut bytes = [0u8; EGL_MSG_SIZE];
        let (len, file) = self
            .stream
            .recv_with_fd(&mut bytes)
            .map_err(io::Error::from)?;
        match len {
            0 => Err(Error::Disconnected),
            EGL_MSG_SIZE => Ok((EglMsg::decode(&bytes)?, file)),
            short => Err(Error::ShortMessage(short)),
        }
    }

    pub fn send(&self, msg: &EglMsg) -> Result<()> {
        Ok(send_one(&self.stream, msg, None)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Seek;

    use assert_matches::assert_matches;
    use vmm_sys_util::{tempdir::TempDir, tempfile::TempFile};

    use super::*;

    #[derive(Debug, Default)]
    struct RecordingConsole {
        events: Vec<String>,
    }

    impl ConsoleSink for RecordingConsole {
        fn input_abs(&mut self, axis: Axis, value: u32, size: u32) {
            self.events.push(format!("abs {axis:?} {value}/{size}"));
        }

        fn input_button(&mut self, button: MouseButton, pressed: bool) {
            self.events.push(format!("button {button:?} {pressed}"));
        }

        fn input_key(&mut self, keycode: u32, pressed: bool) {
            self.events.push(format!("key {keycode} {pressed}"));
        }

        fn input_sync(&mut self) {
            self.events.push("sync".to_string());
        }

        fn gl_block(&mut self, block: bool) {
            self.events.push(format!("block {block}"));
        }
    }

    const BUF: BufferDesc = BufferDesc {
        width: 1024,
        height: 768,
        stride: 4096,
        fourcc: 0x3432_5258,
        y0_top: false,
    };

    fn dmabuf(contents: &[u8]) -> (TempFile, OwnedFd) {
        let file = TempFile::new().unwrap();
        file.as_file().write_all(contents).unwrap();
        let fd = OwnedFd::from(file.as_file().try_clone().unwrap());
        (file, fd)
    }

    fn server(dir: &TempDir) -> EglServer {
        EglServer::bind(dir.as_path().join("egl-sock"), 1).unwrap()
    }

    #[test]
    fn test_socket_path() {
        assert_eq!(
            socket_path(Some("guest")),
            PathBuf::from("/tmp/qemu-egl-sock-guest")
        );
        assert_eq!(socket_path(None), PathBuf::from("/tmp/qemu-egl-sock-noname"));
    }

    #[test]
    fn test_msg_wire_format() {
        let msg = EglMsg::NewBuf {
            display: 1,
            buf: BufferDesc {
                y0_top: true,
                ..BUF
            },
        };
        let bytes = msg.encode();
        assert_eq!(&bytes[0..4], &100u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &1024u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &0x3432_5258u32.to_le_bytes());
        assert_eq!(bytes[24], 1);
        assert_eq!(&bytes[25..], &[0, 0, 0]);
        assert_eq!(EglMsg::decode(&bytes).unwrap(), msg);

        let motion = EglMsg::Motion {
            display: 0,
            x: 10,
            y: 20,
            w: 640,
            h: 480,
        };
        assert_eq!(EglMsg::decode(&motion.encode()).unwrap(), motion);

        let mut bytes = EglMsg::DrawDone { display: 0 }.encode();
        bytes[0] = 0;
        assert_matches!(EglMsg::decode(&bytes), Err(Error::UnknownType(0)));
    }

    #[test]
    fn test_newbuf_on_connect() {
        let dir = TempDir::new().unwrap();
        let mut server = server(&dir);
        let mode = fs::metadata(server.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);

        // Nothing to announce yet.
        let early = EglViewer::connect(server.path()).unwrap();
        assert_eq!(server.accept().unwrap(), 1);

        let (_file, fd) = dmabuf(b"pixels");
        server.gfx_switch(0, BUF, fd).unwrap();
        let (msg, file) = early.recv().unwrap();
        assert_eq!(msg, EglMsg::NewBuf { display: 0, buf: BUF });
        assert!(file.is_some());

        let late = EglViewer::connect(server.path()).unwrap();
        assert_eq!(server.accept().unwrap(), 1);
        assert_eq!(server.num_clients(), 2);
        let (msg, file) = late.recv().unwrap();
        assert_eq!(msg, EglMsg::NewBuf { display: 0, buf: BUF });

        let mut file = file.unwrap();
        file.rewind().unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "pixels");

        assert_eq!(server.accept().unwrap(), 0);
    }

    #[test]
    fn test_updates() {
        let dir = TempDir::new().unwrap();
        let mut server = server(&dir);
        let viewer = EglViewer::connect(server.path()).unwrap();
        server.accept().unwrap();

        // No buffer yet: damage is not forwarded.
        server.gfx_update(0).unwrap();
        server.refresh(0).unwrap();

        let (_file, fd) = dmabuf(b"");
        server.gfx_switch(0, BUF, fd).unwrap();
        assert_matches!(viewer.recv().unwrap(), (EglMsg::NewBuf { .. }, Some(_)));

        server.gfx_update(0).unwrap();
        server.gfx_update(0).unwrap();
        server.refresh(0).unwrap();
        // Already flushed.
        server.refresh(0).unwrap();
        server.mouse_set(0, 5, 6, true).unwrap();

        assert_matches!(viewer.recv().unwrap(), (EglMsg::Update { display: 0 }, None));
        assert_eq!(
            viewer.recv().unwrap().0,
            EglMsg::PointerSet {
                display: 0,
                x: 5,
                y: 6,
                on: true
            }
        );

        assert_matches!(server.gfx_update(1), Err(Error::InvalidDisplay(1)));
        assert_matches!(server.refresh(3), Err(Error::InvalidDisplay(3)));
    }

    #[test]
    fn test_scanout() {
        let dir = TempDir::new().unwrap();
        let mut server = server(&dir);
        let viewer = EglViewer::connect(server.path()).unwrap();
        server.accept().unwrap();

        let (_file, fd) = dmabuf(b"");
        let empty = BufferDesc { width: 0, ..BUF };
        server.scanout(0, empty, fd).unwrap();

        let (_file, fd) = dmabuf(b"");
        let flipped = BufferDesc {
            y0_top: true,
            ..BUF
        };
        server.scanout(0, flipped, fd).unwrap();
        assert_eq!(
            viewer.recv().unwrap().0,
            EglMsg::NewBuf {
                display: 0,
                buf: flipped
            }
        );

        let mut console = RecordingConsole::default();
        server.scanout_flush(0, &mut console).unwrap();
        assert_eq!(console.events, ["block true"]);
        assert_eq!(viewer.recv().unwrap().0, EglMsg::Update { display: 0 });

        viewer.send(&EglMsg::DrawDone { display: 0 }).unwrap();
        server.read_clients(&mut console);
        assert_eq!(console.events, ["block true", "block false"]);
        assert_eq!(server.num_clients(), 1);
    }

    #[test]
    fn test_viewer_input() {
        let dir = TempDir::new().unwrap();
        let mut server = server(&dir);
        let viewer = EglViewer::connect(server.path()).unwrap();
        server.accept().unwrap();

        for msg in [
            EglMsg::Motion {
                display: 0,
                x: 100,
                y: 50,
                w: 1024,
                h: 768,
            },
            EglMsg::ButtonPress {
                display: 0,
                button: 1,
            },
            EglMsg::ButtonRelease {
                display: 0,
                button: 3,
            },
            // Scroll wheel.
            EglMsg::ButtonPress {
                display: 0,
                button: 4,
            },
            EglMsg::KeyPress {
                display: 0,
                keycode: 30,
            },
            EglMsg::KeyRelease {
                display: 0,
                keycode: 30,
            },
            EglMsg::Update { display: 0 },
        ] {
            viewer.send(&msg).unwrap();
        }

        let mut console = RecordingConsole::default();
        server.read_clients(&mut console);
        assert_eq!(
            console.events,
            [
                "abs X 100/1024",
                "abs Y 50/768",
                "sync",
                "button Left true",
                "sync",
                "button Right false",
                "sync",
                "key 30 true",
                "key 30 false",
            ]
        );
        assert_eq!(server.num_clients(), 1);

        // Nothing pending.
        server.read_clients(&mut console);
        assert_eq!(console.events.len(), 9);
    }

    #[test]
    fn test_viewer_disconnect() {
        let dir = TempDir::new().unwrap();
        let mut server = server(&dir);
        let viewer = EglViewer::connect(server.path()).unwrap();
        let other = EglViewer::connect(server.path()).unwrap();
        assert_eq!(server.accept().unwrap(), 2);

        // A partial message counts as a disconnect.
        (&viewer.stream).write_all(&[1, 2, 3]).unwrap();
        let mut console = RecordingConsole::default();
        server.read_clients(&mut console);
        assert_eq!(console.events, ["block false"]);
        assert_eq!(server.num_clients(), 1);

        // Broadcasting to a closed viewer drops it.
        drop(other);
        server.mouse_set(0, 0, 0, false).unwrap();
        assert_eq!(server.num_clients(), 0);
    }

    #[test]
    fn test_viewer_recv_errors() {
        let dir = TempDir::new().unwrap();
        let mut server = server(&dir);
        let viewer = EglViewer::connect(server.path()).unwrap();
        server.accept().unwrap();

        drop(server);
        assert_matches!(viewer.recv(), Err(Error::Disconnected));
        assert_matches!(
            EglViewer::connect(dir.as_path().join("egl-sock")),
            Err(Error::Connect(..))
        );
    }
}
