/// Three items of information may need to be transferred in a
/// Block (Block1 or Block2) option:
/// * the size of the block ([`Block::size`])
/// * whether more blocks are following ([`Block::more`])
/// * the relative number of the block ([`Block::num`]) within a sequence of blocks with the given size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(u32);

impl Block {
  /// Smallest block size
  pub const MIN_SIZE: u16 = 16;
  /// Largest block size
  pub const MAX_SIZE: u16 = 1024;

  /// Create a block, rounding `size` down to a power of two in `16..=1024`
  pub fn new(size: u16, num: u32, more: bool) -> Self {
    let num = num << 4;
    let more = u32::from(more) << 3;
    let size = Self::szx_of(size) as u32;

    Self(num | more | size)
  }

  /// Size exponent (`log2(size) - 4`) of the block size nearest below `size`
  pub fn szx_of(size: u16) -> u8 {
    let size = size.clamp(Self::MIN_SIZE, Self::MAX_SIZE);
    (15 - size.leading_zeros() as u8) - 4
  }

  /// Is `size` one of the sizes a block may have?
  pub fn is_valid_size(size: u16) -> bool {
    size.is_power_of_two() && (Self::MIN_SIZE..=Self::MAX_SIZE).contains(&size)
  }

  /// Size exponent; 7 is reserved and reads as 6
  pub fn szx(&self) -> u8 {
    (self.0 & 0b111).min(6) as u8
  }

  /// `false` if the size exponent is the reserved value 7
  pub fn is_valid(&self) -> bool {
    self.0 & 0b111 != 7
  }

  #[allow(missing_docs)]
  pub fn size(&self) -> u16 {
    2u16.pow(self.szx() as u32 + 4)
  }

  #[allow(missing_docs)]
  pub fn more(&self) -> bool {
    (self.0 & 0b1000) >> 3 == 1
  }

  #[allow(missing_docs)]
  pub fn num(&self) -> u32 {
    self.0 >> 4
  }

  /// Byte offset of this block within the whole body
  pub fn offset(&self) -> usize {
    self.num() as usize * self.size() as usize
  }
}

impl From<Block> for u32 {
  fn from(b: Block) -> Self {
    b.0
  }
}

impl From<u32> for Block {
  fn from(n: u32) -> Self {
    Block(n)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn block() {
    let b = Block(33);
    assert_eq!(b.size(), 32);
    assert_eq!(b.num(), 2);
    assert_eq!(b.more(), false);
    assert_eq!(b.offset(), 64);

    let b = Block(59);
    assert_eq!(b.size(), 128);
    assert_eq!(b.num(), 3);
    assert_eq!(b.more(), true);

    assert_eq!(Block::new(32, 2, false), Block(33));
    assert_eq!(Block::new(128, 3, true), Block(59));
  }

  #[test]
  fn size_rounds_down_to_nearest_power_of_two() {
    assert_eq!(Block::new(0, 1, false).size(), 16);
    assert_eq!(Block::new(10, 1, false).size(), 16);
    assert_eq!(Block::new(17, 1, false).size(), 16);
    assert_eq!(Block::new(31, 1, false).size(), 16);
    assert_eq!(Block::new(33, 1, false).size(), 32);
    assert_eq!(Block::new(64, 1, false).size(), 64);
    assert_eq!(Block::new(512, 1, false).szx(), 5);
    assert_eq!(Block::new(1024, 1, false).size(), 1024);
    assert_eq!(Block::new(2048, 1, false).size(), 1024);
  }

  #[test]
  fn valid_sizes() {
    assert!(Block::is_valid_size(16));
    assert!(Block::is_valid_size(512));
    assert!(!Block::is_valid_size(8));
    assert!(!Block::is_valid_size(500));
    assert!(!Block::is_valid_size(2048));

    assert!(Block::new(1024, 0, false).is_valid());
    assert!(!Block::from(0b0001_0111).is_valid());
    assert_eq!(Block::from(0b0001_0111).size(), 1024);
  }
}
