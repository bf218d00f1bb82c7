use crate::Width;

/// Word-granular RAM backing store.
///
/// Offsets are byte offsets relative to the start of RAM and are bounds-checked by the caller.
/// Sub-word writes are applied with a mask-and-OR on the containing word.
#[derive(Debug, Clone, Default)]
pub(crate) struct WordStore {
    words: Vec<u32>,
}

impl WordStore {
    pub(crate) fn new(len_bytes: usize) -> Self {
        Self {
            words: vec![0; len_bytes.div_ceil(4)],
        }
    }

    #[inline]
    pub(crate) fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }

    pub(crate) fn grow(&mut self, additional_bytes: usize) {
        let words = self.words.len() + additional_bytes.div_ceil(4);
        self.words.resize(words, 0);
    }

    pub(crate) fn clear(&mut self) {
        self.words.fill(0);
    }

    #[inline]
    fn byte(&self, off: usize) -> u8 {
        (self.words[off / 4] >> ((off % 4) * 8)) as u8
    }

    #[inline]
    fn set_byte(&mut self, off: usize, value: u8) {
        let shift = (off % 4) * 8;
        let word = &mut self.words[off / 4];
        *word = (*word & !(0xff << shift)) | (u32::from(value) << shift);
    }

    pub(crate) fn read(&self, off: usize, width: Width) -> u64 {
        match width {
            Width::Word if off % 4 == 0 => u64::from(self.words[off / 4]),
            Width::Half if off % 2 == 0 => {
                u64::from((self.words[off / 4] >> ((off % 4) * 8)) & 0xffff)
            }
            Width::Byte => u64::from(self.byte(off)),
            _ => (0..width.bytes())
                .rev()
                .fold(0u64, |acc, i| (acc << 8) | u64::from(self.byte(off + i))),
        }
    }

    pub(crate) fn write(&mut self, off: usize, width: Width, value: u64) {
        match width {
            Width::Word if off % 4 == 0 => self.words[off / 4] = value as u32,
            Width::Half if off % 2 == 0 => {
                let shift = (off % 4) * 8;
                let word = &mut self.words[off / 4];
                *word = (*word & !(0xffff << shift)) | (((value as u32) & 0xffff) << shift);
            }
            _ => {
                for i in 0..width.bytes() {
                    self.set_byte(off + i, (value >> (i * 8)) as u8);
                }
            }
        }
    }

    /// Little-endian byte image of the whole store.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}
