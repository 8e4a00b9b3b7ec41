use warden::io::buffer::GrowableBuffer;

#[test]
fn test_buffer_put_within_capacity() {
    let mut buf = GrowableBuffer::allocate(4);
    buf.put(b"abc");

    assert_eq!(buf.capacity(), 4);
    assert_eq!(buf.position(), 3);
    assert_eq!(buf.remaining(), 1);
}

#[test]
fn test_buffer_growth_formula() {
    let mut buf = GrowableBuffer::allocate(4);
    buf.put(b"abc");
    buf.put(b"def");

    // (4 + 2 missing) * 1.5
    assert_eq!(buf.capacity(), 9);
    assert_eq!(buf.as_slice(), b"abcdef");

    buf.put(b"0123456789");
    // (9 + 7 missing) * 1.5
    assert_eq!(buf.capacity(), 24);
    assert_eq!(buf.position(), 16);
}

#[test]
fn test_buffer_prepend_then_append() {
    let mut buf = GrowableBuffer::allocate(2);
    buf.put(b"world");
    assert_eq!(buf.capacity(), 7);

    buf.prepend(b"hello ");
    assert_eq!(buf.capacity(), 11);
    assert_eq!(buf.as_slice(), b"hello world");

    buf.put(b"!");
    assert_eq!(buf.as_slice(), b"hello world!");
    assert_eq!(buf.position(), 12);
    assert_eq!(buf.capacity(), 18);
}

#[test]
fn test_buffer_split_and_advance() {
    let mut buf = GrowableBuffer::allocate(16);
    buf.put(b"abc|def|");

    let first = buf.split_to(3);
    assert_eq!(&first[..], b"abc");
    buf.advance(1);
    assert_eq!(buf.as_slice(), b"def|");
    assert_eq!(buf.find(b"|"), Some(3));
    assert_eq!(buf.find(b""), None);

    buf.clear();
    assert!(buf.is_empty());
}
