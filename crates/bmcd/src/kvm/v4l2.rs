//! V4L2 uAPI structures and ioctls for MMAP streaming capture.
//!
//! Mirrors `<linux/videodev2.h>`; only the capture path is declared.
use std::io;
use std::os::fd::RawFd;

pub const VIDIOC_QUERYCAP: libc::c_ulong = 0x8068_5600;
pub const VIDIOC_S_FMT: libc::c_ulong = 0xC0D0_5605;
pub const VIDIOC_REQBUFS: libc::c_ulong = 0xC014_5608;
pub const VIDIOC_QUERYBUF: libc::c_ulong = 0xC058_5609;
pub const VIDIOC_QBUF: libc::c_ulong = 0xC058_560F;
pub const VIDIOC_STREAMON: libc::c_ulong = 0x4004_5612;
pub const VIDIOC_STREAMOFF: libc::c_ulong = 0x4004_5613;
pub const VIDIOC_DQBUF: libc::c_ulong = 0xC058_5611;
pub const VIDIOC_S_PARM: libc::c_ulong = 0xC0CC_5616;

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_FIELD_NONE: u32 = 1;

pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;

pub const V4L2_PIX_FMT_YUYV: u32 = fourcc(b"YUYV");
pub const V4L2_PIX_FMT_MJPEG: u32 = fourcc(b"MJPG");
pub const V4L2_PIX_FMT_RGB24: u32 = fourcc(b"RGB3");

pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32)
        | ((code[1] as u32) << 8)
        | ((code[2] as u32) << 16)
        | ((code[3] as u32) << 24)
}

#[repr(C)]
pub struct Capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[repr(C)]
pub union FormatUnion {
    pub pix: PixFormat,
    pub raw_data: [u8; 200],
    // The kernel union holds pointer-bearing members; keep its alignment.
    align: u64,
}

#[repr(C)]
pub struct Format {
    pub type_: u32,
    pub fmt: FormatUnion,
}

#[repr(C)]
pub struct RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TimeVal {
    pub tv_sec: libc::time_t,
    pub tv_usec: libc::suseconds_t,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TimeCode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
pub union BufferMemory {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub planes: usize,
    pub fd: i32,
}

#[repr(C)]
pub struct Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: TimeVal,
    pub timecode: TimeCode,
    pub sequence: u32,
    pub memory: u32,
    pub m: BufferMemory,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Fract {
    pub numerator: u32,
    pub denominator: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct CaptureParm {
    pub capability: u32,
    pub capturemode: u32,
    pub timeperframe: Fract,
    pub extendedmode: u32,
    pub readbuffers: u32,
    pub reserved: [u32; 4],
}

#[repr(C)]
pub union StreamParmUnion {
    pub capture: CaptureParm,
    pub raw_data: [u8; 200],
}

#[repr(C)]
pub struct StreamParm {
    pub type_: u32,
    pub parm: StreamParmUnion,
}

macro_rules! zeroed_default {
    ($($ty:ty),+ $(,)?) => {$(
        impl Default for $ty {
            fn default() -> Self {
                // All-zero is a valid kernel representation for these PODs.
                unsafe { std::mem::zeroed() }
            }
        }
    )+};
}

zeroed_default!(Capability, Format, RequestBuffers, Buffer, StreamParm);

pub unsafe fn ioctl<T>(fd: RawFd, request: libc::c_ulong, arg: *mut T) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::ioctl(fd, request, arg) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_kernel_abi() {
        assert_eq!(std::mem::size_of::<Capability>(), 104);
        assert_eq!(std::mem::size_of::<Format>(), 208);
        assert_eq!(std::mem::size_of::<RequestBuffers>(), 20);
        assert_eq!(std::mem::size_of::<Buffer>(), 88);
        assert_eq!(std::mem::size_of::<StreamParm>(), 204);
    }

    #[test]
    fn fourcc_encoding() {
        assert_eq!(V4L2_PIX_FMT_YUYV, 0x5659_5559);
    }
}
