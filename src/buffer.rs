//! Fixed-capacity circular byte buffer with vectored socket I/O.
//!
//! A [`RingBuffer`] keeps three counters over one backing allocation: the read
//! cursor, the write cursor and the number of unread bytes. Cursors wrap at the
//! capacity, so the readable (or writable) region is at most two contiguous
//! spans of storage:
//!
//! ```text
//!  write > read                write < read
//!  ┌───┬───────────┬───┐       ┌───────┬───┬───────┐
//!  │   │ readable  │   │       │ rd #2 │   │ rd #1 │
//!  └───┴───────────┴───┘       └───────┴───┴───────┘
//!      r           w                   w   r
//! ```
//!
//! Those spans are described by [`Fragment`]s, computed fresh on every call
//! from the counters alone and handed to `read_vectored`/`write_vectored`, so a
//! single syscall fills or drains the buffer across the wrap point.
//!
//! When both cursors are equal the buffer is either empty or full; only the
//! unread count tells the two apart.

use std::fmt;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};

use crate::error::{Error, Result};

/// A contiguous `(offset, len)` span of a ring buffer's storage.
///
/// Fragments do not borrow the buffer; they are only meaningful until the next
/// mutating call on the buffer that produced them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fragment {
    pub offset: usize,
    pub len: usize,
}

impl Fragment {
    fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// An ordered list of at most two fragments: the part before the end of
/// storage first, the wrapped part starting at offset 0 second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentList {
    fragments: [Fragment; 2],
    len: usize,
}

impl FragmentList {
    fn push(&mut self, fragment: Fragment) {
        debug_assert!(self.len < 2, "a ring buffer region has at most two fragments");
        self.fragments[self.len] = fragment;
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[Fragment] {
        &self.fragments[..self.len]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.as_slice().iter()
    }

    /// Sum of the fragment lengths.
    pub fn total_len(&self) -> usize {
        self.iter().map(|f| f.len).sum()
    }
}

/// Circular byte storage with independent read and write cursors.
///
/// Every bulk operation is all-or-nothing: it checks the available bytes or
/// free space first and fails with [`Error::BufferUnderflow`] or
/// [`Error::BufferOverflow`] without copying anything.
pub struct RingBuffer {
    storage: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    unread: usize,
}

impl RingBuffer {
    /// Creates an empty buffer holding up to `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            storage: vec![0; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            unread: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    pub fn write_position(&self) -> usize {
        self.write_pos
    }

    /// Number of bytes that can currently be read.
    pub fn remaining_can_get(&self) -> usize {
        self.unread
    }

    /// Number of bytes that can currently be written.
    pub fn remaining_can_put(&self) -> usize {
        self.capacity() - self.unread
    }

    pub fn is_empty(&self) -> bool {
        self.unread == 0
    }

    pub fn is_full(&self) -> bool {
        self.unread == self.capacity()
    }

    /// Resets the buffer to empty. The storage is left as is.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.unread = 0;
    }

    /// Forgets the most recently written bytes so that only `len` unread
    /// bytes remain. Does nothing if `len` is not below the unread count.
    pub(crate) fn truncate_to(&mut self, len: usize) {
        if len >= self.unread {
            return;
        }
        let dropped = self.unread - len;
        self.write_pos = (self.write_pos + self.capacity() - dropped) % self.capacity();
        self.unread = len;
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.check_get(1)?;
        let byte = self.storage[self.read_pos];
        self.advance_read(1);
        Ok(byte)
    }

    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.check_put(1)?;
        self.storage[self.write_pos] = value;
        self.advance_write(1);
        Ok(())
    }

    /// Fills `dst` entirely from the readable region.
    pub fn get_slice(&mut self, dst: &mut [u8]) -> Result<()> {
        self.check_get(dst.len())?;
        let mut copied = 0;
        for fragment in self.readable_fragments().iter() {
            if copied == dst.len() {
                break;
            }
            let n = fragment.len.min(dst.len() - copied);
            dst[copied..copied + n]
                .copy_from_slice(&self.storage[fragment.offset..fragment.offset + n]);
            copied += n;
        }
        self.advance_read(copied);
        Ok(())
    }

    /// Appends all of `src` to the writable region.
    pub fn put_slice(&mut self, src: &[u8]) -> Result<()> {
        self.check_put(src.len())?;
        let mut copied = 0;
        for fragment in self.writable_fragments().iter() {
            if copied == src.len() {
                break;
            }
            let n = fragment.len.min(src.len() - copied);
            self.storage[fragment.offset..fragment.offset + n]
                .copy_from_slice(&src[copied..copied + n]);
            copied += n;
        }
        self.advance_write(copied);
        Ok(())
    }

    /// Reads a big-endian `u32`.
    pub fn get_u32(&mut self) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.get_slice(&mut bytes)?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Writes `value` as a big-endian `u32`.
    pub fn put_u32(&mut self, value: u32) -> Result<()> {
        self.put_slice(&value.to_be_bytes())
    }

    /// Discards `n` readable bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.check_get(n)?;
        self.advance_read(n);
        Ok(())
    }

    /// Moves `len` bytes from `src`'s readable region into this buffer's
    /// writable region, advancing both buffers.
    ///
    /// Both fragment lists are walked in lockstep and each copy is cut at
    /// whichever fragment boundary comes first, so no intermediate buffer is
    /// needed however the two buffers happen to be wrapped.
    pub fn put_ring(&mut self, src: &mut RingBuffer, len: usize) -> Result<()> {
        src.check_get(len)?;
        self.check_put(len)?;

        let src_fragments = src.readable_fragments();
        let dst_fragments = self.writable_fragments();
        let (src_fragments, dst_fragments) = (src_fragments.as_slice(), dst_fragments.as_slice());

        let (mut si, mut di) = (0, 0);
        let (mut src_off, mut dst_off) = (0, 0);
        let mut copied = 0;
        while copied < len {
            let s = src_fragments[si];
            let d = dst_fragments[di];
            let n = (s.len - src_off).min(d.len - dst_off).min(len - copied);

            let from = s.offset + src_off;
            let to = d.offset + dst_off;
            self.storage[to..to + n].copy_from_slice(&src.storage[from..from + n]);

            copied += n;
            src_off += n;
            dst_off += n;
            if src_off == s.len {
                si += 1;
                src_off = 0;
            }
            if dst_off == d.len {
                di += 1;
                dst_off = 0;
            }
        }

        src.advance_read(len);
        self.advance_write(len);
        Ok(())
    }

    /// Performs one vectored read from `reader` into the writable region and
    /// advances the write cursor by the number of bytes read.
    ///
    /// Returns `Ok(0)` without calling the reader when the buffer is full, so
    /// callers must check [`remaining_can_put`](Self::remaining_can_put)
    /// before treating `0` as end-of-stream.
    pub fn read_from_channel<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let fragments = self.writable_fragments();
        let available = fragments.total_len();
        let n = match fragments.as_slice() {
            [] => return Ok(0),
            [only] => {
                let mut bufs = [IoSliceMut::new(&mut self.storage[only.offset..only.end()])];
                reader.read_vectored(&mut bufs)?
            }
            [tail, head, ..] => {
                let (low, high) = self.storage.split_at_mut(tail.offset);
                let mut bufs = [
                    IoSliceMut::new(&mut high[..tail.len]),
                    IoSliceMut::new(&mut low[head.offset..head.end()]),
                ];
                reader.read_vectored(&mut bufs)?
            }
        };
        debug_assert!(n <= available, "reader reported more bytes than it was given");
        self.advance_write(n.min(available));
        Ok(n)
    }

    /// Performs one vectored write of the readable region to `writer` and
    /// advances the read cursor by the number of bytes written.
    pub fn write_to_channel<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        let fragments = self.readable_fragments();
        let available = fragments.total_len();
        let n = match fragments.as_slice() {
            [] => return Ok(0),
            [only] => writer.write_vectored(&[IoSlice::new(&self.storage[only.offset..only.end()])])?,
            [tail, head, ..] => writer.write_vectored(&[
                IoSlice::new(&self.storage[tail.offset..tail.end()]),
                IoSlice::new(&self.storage[head.offset..head.end()]),
            ])?,
        };
        debug_assert!(n <= available, "writer reported more bytes than it was given");
        self.advance_read(n.min(available));
        Ok(n)
    }

    /// The spans currently holding unread data, in read order.
    pub fn readable_fragments(&self) -> FragmentList {
        let (r, w, cap) = (self.read_pos, self.write_pos, self.capacity());
        let mut list = FragmentList::default();
        if w > r {
            list.push(Fragment::new(r, w - r));
        } else if w < r {
            list.push(Fragment::new(r, cap - r));
            if w > 0 {
                list.push(Fragment::new(0, w));
            }
        } else if self.unread == cap {
            // write cursor caught up with the read cursor: everything is readable
            list.push(Fragment::new(r, cap - r));
            if r > 0 {
                list.push(Fragment::new(0, r));
            }
        }
        list
    }

    /// The spans currently free for writing, in write order.
    pub fn writable_fragments(&self) -> FragmentList {
        let (r, w, cap) = (self.read_pos, self.write_pos, self.capacity());
        let mut list = FragmentList::default();
        if w > r {
            list.push(Fragment::new(w, cap - w));
            if r > 0 {
                list.push(Fragment::new(0, r));
            }
        } else if w < r {
            list.push(Fragment::new(w, r - w));
        } else if self.unread == 0 {
            // read cursor caught up with the write cursor: everything is free
            list.push(Fragment::new(w, cap - w));
            if w > 0 {
                list.push(Fragment::new(0, w));
            }
        }
        list
    }

    fn check_get(&self, requested: usize) -> Result<()> {
        if requested > self.unread {
            return Err(Error::BufferUnderflow {
                requested,
                available: self.unread,
            });
        }
        Ok(())
    }

    fn check_put(&self, requested: usize) -> Result<()> {
        let available = self.remaining_can_put();
        if requested > available {
            return Err(Error::BufferOverflow {
                requested,
                available,
            });
        }
        Ok(())
    }

    fn advance_read(&mut self, step: usize) {
        debug_assert!(step <= self.unread);
        self.read_pos = (self.read_pos + step) % self.capacity();
        self.unread -= step;
    }

    fn advance_write(&mut self, step: usize) {
        debug_assert!(step <= self.remaining_can_put());
        self.write_pos = (self.write_pos + step) % self.capacity();
        self.unread += step;
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("read_position", &self.read_pos)
            .field("write_position", &self.write_pos)
            .field("unread", &self.unread)
            .finish()
    }
}
