//! Linux magnetic tape driver ioctl definitions
//!
//! from: /usr/include/x86_64-linux-gnu/sys/mtio.h
//!
//! also see: man 4 st

#![allow(dead_code)]

#[repr(C)]
pub struct mtop {
    pub mt_op: MTCmd,          /* Operations defined below.  */
    pub mt_count: libc::c_int, /* How many of them.  */
}

#[repr(i16)]
pub enum MTCmd {
    MTFSF = 1,   /* forward space over FileMark,
                  * position at first record of next file
                  */
    MTBSF = 2,   /* backward space FileMark (position before FM) */
    MTWEOF = 5,  /* write an end-of-file record (mark) */
    MTREW = 6,   /* rewind */
    MTOFFL = 7,  /* rewind and put the drive offline (eject?) */
    MTNOP = 8,   /* no op, set status only (read with MTIOCGET) */
    MTEOM = 12,  /* goto end of recorded media (for appending files) */
    MTERASE = 13, /* erase tape -- be careful! */
    MTSETBLK = 20, /* set block length (SCSI) */
    MTSEEK = 22, /* seek to block (Tandberg, etc.) */
    MTTELL = 23, /* tell block (Tandberg, etc.) */
    MTLOAD = 30, /* execute the SCSI load command */
    MTWEOFI = 35, /* write an end-of-file record (mark) in immediate mode */
}

//#define MTIOCTOP _IOW('m', 1, struct mtop)  /* Do a mag tape op. */
nix::ioctl_write_ptr!(mtioctop, b'm', 1, mtop);

// from: /usr/include/x86_64-linux-gnu/sys/mtio.h
#[derive(Default, Debug)]
#[repr(C)]
pub struct mtget {
    pub mt_type: libc::c_long,  /* Type of magtape device.  */
    pub mt_resid: libc::c_long, /* Residual count.  */
    /* The following registers are device dependent.  */
    pub mt_dsreg: libc::c_long, /* Status register.  */
    pub mt_gstat: libc::c_long, /* Generic (device independent) status.  */
    pub mt_erreg: libc::c_long, /* Error register.  */
    /* The next two fields are not always used.  */
    pub mt_fileno: i32, /* Number of current file on tape.  */
    pub mt_blkno: i32,  /* Current block number.  */
}

//#define MTIOCGET _IOR('m', 2, struct mtget)  /* Get tape status.  */
nix::ioctl_read!(mtiocget, b'm', 2, mtget);

#[repr(C)]
pub struct mtpos {
    pub mt_blkno: libc::c_long, /* current block number */
}

//#define MTIOCPOS _IOR('m', 3, struct mtpos)  /* Get tape position.  */
nix::ioctl_read!(mtiocpos, b'm', 3, mtpos);

pub const MT_ST_BLKSIZE_MASK: libc::c_long = 0x0ffffff;
pub const MT_ST_BLKSIZE_SHIFT: usize = 0;
pub const MT_ST_DENSITY_MASK: libc::c_long = 0xff000000;
pub const MT_ST_DENSITY_SHIFT: usize = 24;

// Generic Mag Tape (device independent) status macros for examining
// mt_gstat, from: /usr/include/x86_64-linux-gnu/sys/mtio.h
bitflags::bitflags! {
    pub struct GMTStatusFlags: libc::c_long {
        const EOF = 0x80000000;
        const BOT = 0x40000000;
        const EOT = 0x20000000;
        const EOD = 0x08000000;
        const WR_PROT = 0x04000000;
        const ONLINE = 0x01000000;
        const DRIVE_OPEN = 0x00040000; /* Door open (no tape).  */
    }
}
