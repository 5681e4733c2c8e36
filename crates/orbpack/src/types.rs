//! Core types for the orbpack wire format

/// First byte value reserved for type tags. Bytes below it are packed
/// integers: byte `b` stands for the integer `b - 1`.
pub const START: u8 = 0xEF;

/// Largest integer that still fits in a packed tag byte.
pub const PACKED_MAX: i64 = START as i64 - 2;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    IntPos = 0xEF,
    IntNeg = 0xF0,
    False = 0xF1,
    True = 0xF2,
    Bytes = 0xF3,
    String = 0xF4,
    StringEnc = 0xF5,
    Tuple = 0xF6,
    Exception = 0xF7,
    None = 0xF8,
    Float10 = 0xF9,
    Float2 = 0xFA,
    FloatN = 0xFB,
    RefLocal = 0xFC,
    RefRemote = 0xFD,
    Tagged = 0xFE,
}

impl Tag {
    pub const fn from_u8(b: u8) -> Option<Self> {
        match b {
            0xEF => Some(Tag::IntPos),
            0xF0 => Some(Tag::IntNeg),
            0xF1 => Some(Tag::False),
            0xF2 => Some(Tag::True),
            0xF3 => Some(Tag::Bytes),
            0xF4 => Some(Tag::String),
            0xF5 => Some(Tag::StringEnc),
            0xF6 => Some(Tag::Tuple),
            0xF7 => Some(Tag::Exception),
            0xF8 => Some(Tag::None),
            0xF9 => Some(Tag::Float10),
            0xFA => Some(Tag::Float2),
            0xFB => Some(Tag::FloatN),
            0xFC => Some(Tag::RefLocal),
            0xFD => Some(Tag::RefRemote),
            0xFE => Some(Tag::Tagged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A variable-length integer could not be parsed.
    MalformedVarint,
    /// A tag byte at or above `START` that names no type.
    UnknownTag(u8),
    /// A declared length does not fit the data that carries it.
    LengthMismatch,
    /// An object id that is not registered with the context.
    UnknownObjectId(u64),
    /// A non-lazy lookup of an object the context has never seen.
    Unregistered,
    /// An object id outside the range the context can hold.
    IdOutOfRange,
    /// A string codec name that is not supported.
    UnknownCodec(String),
    /// String data that is not valid for its codec.
    InvalidText(String),
    /// A float whose base is below 2.
    InvalidFloatBase,
    /// A structurally valid encoding that does not form a value.
    InvalidValue(String),
    /// A remote reference passed where a local object was required.
    RemoteAsLocal,
    /// A configured reader limit was exceeded.
    LimitExceeded(String),
    /// The reader failed earlier and must be reset.
    ReaderFailed,
    /// The value is not complete yet.
    Incomplete,
    /// Bytes remained after a complete value.
    TrailingData(usize),
    /// The writer already holds a value.
    WriterBusy,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedVarint => write!(f, "Malformed varint"),
            Self::UnknownTag(tag) => write!(f, "Unknown tag byte 0x{:02x}", tag),
            Self::LengthMismatch => write!(f, "Length prefix does not match data"),
            Self::UnknownObjectId(id) => write!(f, "Unknown object id {}", id),
            Self::Unregistered => write!(f, "Object is not registered"),
            Self::IdOutOfRange => write!(f, "Object id out of range"),
            Self::UnknownCodec(name) => write!(f, "Unknown string codec '{}'", name),
            Self::InvalidText(msg) => write!(f, "Invalid string data: {}", msg),
            Self::InvalidFloatBase => write!(f, "Float base must be at least 2"),
            Self::InvalidValue(msg) => write!(f, "Invalid value: {}", msg),
            Self::RemoteAsLocal => write!(f, "Remote reference cannot be registered as local"),
            Self::LimitExceeded(what) => write!(f, "Reader limit exceeded: {}", what),
            Self::ReaderFailed => write!(f, "Reader failed earlier and must be reset"),
            Self::Incomplete => write!(f, "Value is not complete"),
            Self::TrailingData(n) => write!(f, "{} bytes left after value", n),
            Self::WriterBusy => write!(f, "Writer already holds a value"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
