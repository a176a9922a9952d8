//! Helpers for assembling little-endian on-disc structures in memory.


pub(crate) trait ByteBufWritable {
    fn write(&self, buf: &mut [u8], pos: &mut usize);
}
impl ByteBufWritable for u8 {
    fn write(&self, buf: &mut [u8], pos: &mut usize) {
        buf[*pos] = *self;
        *pos += 1;
    }
}
impl<const N: usize> ByteBufWritable for [u8; N] {
    fn write(&self, buf: &mut [u8], pos: &mut usize) {
        buf[*pos..*pos+N].copy_from_slice(self);
        *pos += N;
    }
}
impl ByteBufWritable for &[u8] {
    fn write(&self, buf: &mut [u8], pos: &mut usize) {
        buf[*pos..*pos+self.len()].copy_from_slice(self);
        *pos += self.len();
    }
}

pub(crate) trait WriteEndian {
    fn write_le(&self, buf: &mut [u8], pos: &mut usize);
}
macro_rules! impl_write_endian {
    ($type:ty) => {
        impl WriteEndian for $type {
            fn write_le(&self, buf: &mut [u8], pos: &mut usize) {
                let size = ::std::mem::size_of::<$type>();
                buf[*pos..*pos+size].copy_from_slice(&self.to_le_bytes());
                *pos += size;
            }
        }
    };
}
impl_write_endian!(u16);
impl_write_endian!(i16);
impl_write_endian!(u32);
impl_write_endian!(u64);


/// Cursor over a zero-initialized buffer that fills fields in order.
#[derive(Debug)]
pub(crate) struct FieldWriter<'b> {
    buf: &'b mut [u8],
    pos: usize,
}
impl<'b> FieldWriter<'b> {
    pub fn new(buf: &'b mut [u8], pos: usize) -> Self {
        Self {
            buf,
            pos,
        }
    }

    pub fn pos(&self) -> usize { self.pos }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        value.write(self.buf, &mut self.pos);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        value.write_le(self.buf, &mut self.pos);
        self
    }

    pub fn i16(&mut self, value: i16) -> &mut Self {
        value.write_le(self.buf, &mut self.pos);
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        value.write_le(self.buf, &mut self.pos);
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        value.write_le(self.buf, &mut self.pos);
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        value.write(self.buf, &mut self.pos);
        self
    }

    /// Leaves `count` bytes at zero.
    pub fn skip(&mut self, count: usize) -> &mut Self {
        self.pos += count;
        self
    }
}
