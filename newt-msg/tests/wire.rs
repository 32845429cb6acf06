use newt_msg::{known, stream, Code, Id, Message, MessageParseError, OptNumber, OptValue,
               Payload, Token, TryFromBytes, TryIntoBytes, Type};

#[test]
fn con_get_with_token_0x37() {
  let mut msg = Message::new(Type::Con, Code::GET, Id(0x1234), Token::from_bytes(&[0x37]));
  msg.set_path("a");

  let bytes = msg.clone().try_into_bytes().unwrap();
  assert_eq!(bytes,
             vec![0b01_00_0001, 0b000_00001, 0x12, 0x34, 0x37, 0b1011_0001, b'a']);
  assert_eq!(Message::try_from_bytes(&bytes).unwrap(), msg);
}

#[test]
fn options_are_sorted_on_the_wire() {
  let mut msg = Message::new(Type::Non, Code::POST, Id(1), Token::default());
  msg.set_u32(known::no_repeat::SIZE1, 2600);
  msg.set_block1(512, 0, true);
  msg.set_path("fw");

  let bytes = msg.clone().try_into_bytes().unwrap();
  let parsed = Message::try_from_bytes(&bytes).unwrap();

  let numbers = parsed.opts.keys().copied().collect::<Vec<_>>();
  assert_eq!(numbers,
             vec![known::no_repeat::PATH, known::BLOCK1, known::no_repeat::SIZE1]);
  assert_eq!(parsed, msg);
}

#[test]
fn large_option_numbers_use_extended_deltas() {
  let mut msg = Message::new(Type::Con, Code::GET, Id(1), Token::default());
  msg.set(OptNumber(2048), OptValue(vec![1, 2, 3]));

  let bytes = msg.clone().try_into_bytes().unwrap();
  assert_eq!(bytes[4] >> 4, 14);
  assert_eq!(Message::try_from_bytes(&bytes).unwrap(), msg);
}

#[test]
fn payload_survives_both_framings() {
  let mut msg = Message::new(Type::Non, Code::new(2, 5), Id(9), Token::from_bytes(&[1, 2]));
  msg.payload = Payload((0..=255u8).cycle().take(2600).collect());

  let dgram = msg.clone().try_into_bytes().unwrap();
  assert_eq!(Message::try_from_bytes(&dgram).unwrap().payload, msg.payload);

  let frame = stream::try_into_bytes(&msg).unwrap();
  assert_eq!(stream::try_from_bytes(&frame).unwrap().payload, msg.payload);
  assert!(frame.len() < dgram.len() + 4);
}

#[test]
fn truncated_input_is_an_error() {
  let msg = Message::new(Type::Con, Code::GET, Id(1), Token::from_bytes(&[1, 2, 3, 4]));
  let bytes = msg.try_into_bytes().unwrap();

  assert_eq!(Message::try_from_bytes(&bytes[..6]),
             Err(MessageParseError::UnexpectedEndOfStream));
  assert_eq!(Message::try_from_bytes(&bytes[..2]),
             Err(MessageParseError::UnexpectedEndOfStream));
}
