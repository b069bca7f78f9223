//! SFTP file attributes.

use crate::error::Result;
use crate::sftp::codec::PacketReader;
use crate::sftp::consts::{ATTR_ACMODTIME, ATTR_EXTENDED, ATTR_PERMISSIONS, ATTR_SIZE, ATTR_UIDGID};

/// Decoded version-3 ATTRS structure.
///
/// Each field after `flags` is meaningful only when the matching flag bit
/// is set; unset fields decode to zero. When unpacked from a NAME reply
/// the short filename and the server's "longname" form are carried too.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    pub flags: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    /// POSIX mode bits; version 3 has no dedicated file-type field, so
    /// type checks go through the `S_IFMT` bits in here.
    pub permissions: u32,
    pub atime: u32,
    pub mtime: u32,
    pub extended: Vec<(Vec<u8>, Vec<u8>)>,
    pub filename: Option<String>,
    pub longname: Option<String>,
}

impl Attributes {
    /// Decode the attribute tail of an ATTRS or NAME reply.
    pub fn unpack(r: &mut PacketReader<'_>) -> Result<Self> {
        let flags = r.get_u32()?;
        let mut attrs = Attributes {
            flags,
            ..Attributes::default()
        };
        if flags & ATTR_SIZE != 0 {
            attrs.size = r.get_u64()?;
        }
        if flags & ATTR_UIDGID != 0 {
            attrs.uid = r.get_u32()?;
            attrs.gid = r.get_u32()?;
        }
        if flags & ATTR_PERMISSIONS != 0 {
            attrs.permissions = r.get_u32()?;
        }
        if flags & ATTR_ACMODTIME != 0 {
            attrs.atime = r.get_u32()?;
            attrs.mtime = r.get_u32()?;
        }
        if flags & ATTR_EXTENDED != 0 {
            let count = r.get_u32()?;
            for _ in 0..count {
                let extended_type = r.get_str()?;
                let extended_data = r.get_str()?;
                attrs.extended.push((extended_type, extended_data));
            }
        }
        Ok(attrs)
    }

    /// Decode one NAME entry: filename, longname, then the attributes.
    pub fn unpack_named(r: &mut PacketReader<'_>) -> Result<Self> {
        let filename = r.get_str()?;
        let longname = r.get_str()?;
        let mut attrs = Self::unpack(r)?;
        attrs.filename = Some(String::from_utf8_lossy(&filename).into_owned());
        attrs.longname = Some(String::from_utf8_lossy(&longname).into_owned());
        Ok(attrs)
    }

    /// Directory check via the POSIX type bits of `permissions`.
    pub fn is_dir(&self) -> bool {
        self.flags & ATTR_PERMISSIONS != 0
            && self.permissions & (libc::S_IFMT as u32) == libc::S_IFDIR as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::codec::PacketBuilder;

    fn decode(build: impl FnOnce(&mut PacketBuilder)) -> Attributes {
        let mut p = PacketBuilder::new(0);
        build(&mut p);
        let packet = p.finish();
        let mut r = PacketReader::new(&packet[5..]);
        Attributes::unpack(&mut r).unwrap()
    }

    #[test]
    fn unpack_size_and_permissions() {
        let attrs = decode(|p| {
            p.put_u32(ATTR_SIZE | ATTR_PERMISSIONS);
            p.put_u64(10240);
            p.put_u32(0o100644);
        });
        assert_eq!(attrs.size, 10240);
        assert_eq!(attrs.permissions, 0o100644);
        assert_eq!(attrs.uid, 0);
        assert!(!attrs.is_dir());
    }

    #[test]
    fn unpack_all_fields() {
        let attrs = decode(|p| {
            p.put_u32(ATTR_SIZE | ATTR_UIDGID | ATTR_PERMISSIONS | ATTR_ACMODTIME | ATTR_EXTENDED);
            p.put_u64(1);
            p.put_u32(1000);
            p.put_u32(100);
            p.put_u32(0o100600);
            p.put_u32(1111);
            p.put_u32(2222);
            p.put_u32(1);
            p.put_str(b"owner@example");
            p.put_str(b"alice");
        });
        assert_eq!(attrs.uid, 1000);
        assert_eq!(attrs.gid, 100);
        assert_eq!(attrs.atime, 1111);
        assert_eq!(attrs.mtime, 2222);
        assert_eq!(attrs.extended, vec![(b"owner@example".to_vec(), b"alice".to_vec())]);
    }

    #[test]
    fn directory_detected_from_type_bits() {
        let attrs = decode(|p| {
            p.put_u32(ATTR_PERMISSIONS);
            p.put_u32(0o040755);
        });
        assert!(attrs.is_dir());
    }

    #[test]
    fn no_permissions_flag_is_not_a_directory() {
        let attrs = decode(|p| {
            p.put_u32(ATTR_SIZE);
            p.put_u64(4);
        });
        assert!(!attrs.is_dir());
    }

    #[test]
    fn truncated_attrs_error() {
        let mut p = PacketBuilder::new(0);
        p.put_u32(ATTR_SIZE); // claims a size follows, but nothing does
        let packet = p.finish();
        let mut r = PacketReader::new(&packet[5..]);
        assert!(Attributes::unpack(&mut r).is_err());
    }

    #[test]
    fn unpack_named_carries_filenames() {
        let mut p = PacketBuilder::new(0);
        p.put_str(b"motd");
        p.put_str(b"-rw-r--r-- 1 root root 42 motd");
        p.put_u32(ATTR_SIZE);
        p.put_u64(42);
        let packet = p.finish();
        let mut r = PacketReader::new(&packet[5..]);
        let attrs = Attributes::unpack_named(&mut r).unwrap();
        assert_eq!(attrs.filename.as_deref(), Some("motd"));
        assert_eq!(attrs.size, 42);
    }
}
