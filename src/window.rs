//! A `Read + Write + Seek` view restricted to `[base, ..)` of an inner
//! stream, used while building a partition so offsets written through it are
//! partition-relative (spec.md 4.2) without the builder having to track the
//! disc-relative offset everywhere.

use std::io::{self, Read, Seek, SeekFrom, Write};

pub struct IOWindow<'a, S> {
    inner: &'a mut S,
    base: u64,
    pos: u64,
}

impl<'a, S: Seek> IOWindow<'a, S> {
    pub fn new(inner: &'a mut S, base: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(base))?;
        Ok(IOWindow { inner, base, pos: 0 })
    }
}

impl<'a, S: Read + Seek> Read for IOWindow<'a, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.seek(SeekFrom::Start(self.base + self.pos))?;
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<'a, S: Write + Seek> Write for IOWindow<'a, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.seek(SeekFrom::Start(self.base + self.pos))?;
        let n = self.inner.write(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<'a, S: Seek> Seek for IOWindow<'a, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(off) => self.pos as i64 + off,
            SeekFrom::End(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "seeking from the end of an IOWindow is not supported",
                ))
            }
        };
        if new_pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "negative seek"));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_and_writes_are_offset_by_base() {
        let mut backing = vec![0u8; 32];
        let mut cur = Cursor::new(&mut backing);
        let mut window = IOWindow::new(&mut cur, 16).unwrap();
        window.write_all(&[1, 2, 3, 4]).unwrap();
        window.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 4];
        window.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(&backing[16..20], &[1, 2, 3, 4]);
    }
}
