use std::borrow::Cow;

/// Trait for converting a value into a copy-on-write byte buffer.
pub trait BCowConvert<'a> {
    fn convert(self) -> Cow<'a, [u8]>;
}

impl<'a> BCowConvert<'a> for &'a str {
    fn convert(self) -> Cow<'a, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }
}

impl<'a> BCowConvert<'a> for &'a [u8] {
    fn convert(self) -> Cow<'a, [u8]> {
        Cow::Borrowed(self)
    }
}

impl<'a> BCowConvert<'a> for String {
    fn convert(self) -> Cow<'a, [u8]> {
        Cow::Owned(self.into_bytes())
    }
}

impl<'a> BCowConvert<'a> for Vec<u8> {
    fn convert(self) -> Cow<'a, [u8]> {
        Cow::Owned(self)
    }
}
