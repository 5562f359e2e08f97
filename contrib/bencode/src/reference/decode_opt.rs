/// Stores decoding options for controlling how bencode is parsed.
#[derive(Copy, Clone, Debug)]
pub struct BDecodeOpt {
    max_recursion: usize,
    enforce_full_decode: bool,
}

impl BDecodeOpt {
    /// Creates a new `BDecodeOpt` object.
    ///
    /// `max_recursion` is the maximum nesting depth of lists and
    /// dictionaries; reaching it fails the decode. `enforce_full_decode`
    /// requires the outermost value to consume the whole input.
    #[must_use]
    pub fn new(max_recursion: usize, enforce_full_decode: bool) -> BDecodeOpt {
        BDecodeOpt {
            max_recursion,
            enforce_full_decode,
        }
    }

    /// Maximum depth of nesting allowed when decoding.
    #[must_use]
    pub fn max_recursion(&self) -> usize {
        self.max_recursion
    }

    /// Whether or not an error should be thrown for input containing data
    /// after the decoded value.
    #[must_use]
    pub fn enforce_full_decode(&self) -> bool {
        self.enforce_full_decode
    }
}

impl Default for BDecodeOpt {
    fn default() -> BDecodeOpt {
        BDecodeOpt::new(1024, true)
    }
}
