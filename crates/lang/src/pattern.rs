//! Runtime pattern tree
//!
//! The observable output of a run: typed, offset-bearing nodes describing
//! slices of the byte source. Parents exclusively own their children;
//! there are no back references, so a finished tree is a plain value that
//! can be cloned, compared and handed to other threads.
//!
//! Leaf values are cached at creation time, which keeps the tree
//! self-contained: provider changes after a run never shift or reinterpret
//! it.

use crate::token::Endian;
use crate::value::Value;

/// One resolved enum constant: display name plus the inclusive value
/// range it covers (single-value constants have `min == max`).
#[derive(Debug, Clone, PartialEq)]
pub struct EnumValueEntry {
    pub name: String,
    pub min: Value,
    pub max: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatternKind {
    /// Unsigned integer, 1/2/4/8/16 bytes.
    Unsigned,
    /// Signed integer, 1/2/4/8/16 bytes.
    Signed,
    /// IEEE float, 4 or 8 bytes.
    Float,
    Boolean,
    Character,
    Character16,
    String,
    WideString,
    Enum {
        entries: Vec<EnumValueEntry>,
        /// Name of the matching constant, if any.
        matched: Option<String>,
    },
    Bitfield {
        fields: Vec<Pattern>,
    },
    BitfieldField {
        bit_offset: u32,
        bit_size: u32,
        is_bool: bool,
        enum_entries: Vec<EnumValueEntry>,
        matched: Option<String>,
    },
    Struct {
        members: Vec<Pattern>,
    },
    Union {
        members: Vec<Pattern>,
    },
    /// Homogeneous fixed-count array: one template pattern plus the raw
    /// bytes of the whole region, decoded on demand by `array_entry`.
    StaticArray {
        template: Box<Pattern>,
        count: u64,
        data: Vec<u8>,
    },
    /// Heterogeneous or condition-driven array with explicit children.
    DynamicArray {
        entries: Vec<Pattern>,
    },
    Pointer {
        pointee: Box<Pattern>,
    },
    Padding,
    /// Placeholder for a sub-evaluation failure a host chose to tolerate.
    Error {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct Pattern {
    /// Absolute byte offset into the provider.
    pub offset: u64,
    /// Size in bytes. Bitfield fields report their container's size.
    pub size: u64,
    pub endian: Endian,
    /// Formatted type name (`u32`, `struct Point`, ...).
    pub type_name: String,
    /// Variable / member name.
    pub name: String,
    /// `[[name("...")]]` override.
    pub display_name: Option<String>,
    /// `[[comment("...")]]`.
    pub comment: Option<String>,
    /// `[[color("RRGGBB")]]` / `[[single_color]]`, as 0xRRGGBB.
    pub color: Option<u32>,
    pub hidden: bool,
    pub inlined: bool,
    /// Local (function/stack) variable; `offset` is a value-stack slot.
    pub local: bool,
    /// `[[format(...)]]` function name.
    pub formatter: Option<String>,
    /// `[[transform(...)]]` function name.
    pub transform: Option<String>,
    /// Cached output of the formatter function.
    pub formatted_value: Option<String>,
    /// Cached raw (post-transform) value for leaf patterns.
    pub value: Option<Value>,
    pub kind: PatternKind,
}

impl Pattern {
    pub fn new(
        kind: PatternKind,
        offset: u64,
        size: u64,
        endian: Endian,
        type_name: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Pattern {
            offset,
            size,
            endian,
            type_name: type_name.into(),
            name: name.into(),
            display_name: None,
            comment: None,
            color: None,
            hidden: false,
            inlined: false,
            local: false,
            formatter: None,
            transform: None,
            formatted_value: None,
            value: None,
            kind,
        }
    }

    /// Placeholder node for a tolerated sub-evaluation failure.
    pub fn error(offset: u64, size: u64, name: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut pattern = Pattern::new(
            PatternKind::Error {
                message: message.clone(),
            },
            offset,
            size,
            Endian::native(),
            "error",
            name,
        );
        pattern.formatted_value = Some(message);
        pattern
    }

    /// Name shown to the user: the `[[name]]` override if present.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// Directly owned children, in declaration order.
    pub fn children(&self) -> Vec<&Pattern> {
        match &self.kind {
            PatternKind::Struct { members } | PatternKind::Union { members } => {
                members.iter().collect()
            }
            PatternKind::Bitfield { fields } => fields.iter().collect(),
            PatternKind::DynamicArray { entries } => entries.iter().collect(),
            PatternKind::StaticArray { template, .. } => vec![template.as_ref()],
            PatternKind::Pointer { pointee } => vec![pointee.as_ref()],
            _ => Vec::new(),
        }
    }

    /// Entry `index` of a static array, decoded from the cached bytes.
    pub fn array_entry(&self, index: u64) -> Option<Pattern> {
        let PatternKind::StaticArray {
            template,
            count,
            data,
        } = &self.kind
        else {
            return None;
        };
        if index >= *count {
            return None;
        }

        let elem_size = template.size as usize;
        let start = index as usize * elem_size;
        let bytes = data.get(start..start + elem_size)?;

        let mut entry = (**template).clone();
        entry.offset = self.offset + index * template.size;
        entry.name = format!("[{}]", index);
        entry.value = decode_scalar(&entry.kind, bytes, entry.endian);
        Some(entry)
    }

    /// Formatted display value: the `[[format]]` result if one was
    /// applied, else a variant-specific default rendering.
    pub fn format_value(&self) -> String {
        if let Some(cached) = &self.formatted_value {
            return cached.clone();
        }

        match (&self.kind, &self.value) {
            (PatternKind::Unsigned, Some(Value::Unsigned(v))) => format!("{} (0x{:X})", v, v),
            (PatternKind::Signed, Some(Value::Signed(v))) => format!("{} (0x{:X})", v, v.unsigned_abs()),
            (PatternKind::Float, Some(Value::Float(v))) => format!("{}", v),
            (PatternKind::Boolean, Some(Value::Bool(v))) => format!("{}", v),
            (PatternKind::Character, Some(Value::Char(c))) => format!("'{}'", c.escape_default()),
            (PatternKind::Character16, Some(v)) => format!("'{}'", v),
            (PatternKind::String, Some(Value::String(s)))
            | (PatternKind::WideString, Some(Value::String(s))) => format!("\"{}\"", s),
            (PatternKind::Enum { matched, .. }, Some(v)) => match matched {
                Some(name) => format!("{} ({})", name, v),
                None => format!("<unknown> ({})", v),
            },
            (PatternKind::BitfieldField { matched, is_bool, .. }, Some(v)) => {
                if let Some(name) = matched {
                    format!("{} ({})", name, v)
                } else if *is_bool {
                    match v.to_bool() {
                        Ok(b) => format!("{}", b),
                        Err(_) => format!("{}", v),
                    }
                } else {
                    format!("{}", v)
                }
            }
            (PatternKind::Struct { .. }, _)
            | (PatternKind::Union { .. }, _)
            | (PatternKind::Bitfield { .. }, _) => "{ ... }".to_string(),
            (PatternKind::StaticArray { count, .. }, _) => format!("[{}]", count),
            (PatternKind::DynamicArray { entries }, _) => format!("[{}]", entries.len()),
            (PatternKind::Pointer { pointee }, Some(v)) => {
                format!("*0x{:X} -> {}", v.to_u64().unwrap_or(0), pointee.type_name)
            }
            (PatternKind::Padding, _) => String::new(),
            (PatternKind::Error { message }, _) => message.clone(),
            (_, Some(v)) => format!("{}", v),
            (_, None) => String::new(),
        }
    }

    pub fn accept<V: PatternVisitor + ?Sized>(&self, visitor: &mut V) {
        match &self.kind {
            PatternKind::Unsigned => visitor.visit_unsigned(self),
            PatternKind::Signed => visitor.visit_signed(self),
            PatternKind::Float => visitor.visit_float(self),
            PatternKind::Boolean => visitor.visit_boolean(self),
            PatternKind::Character => visitor.visit_character(self),
            PatternKind::Character16 => visitor.visit_character16(self),
            PatternKind::String => visitor.visit_string(self),
            PatternKind::WideString => visitor.visit_wide_string(self),
            PatternKind::Enum { .. } => visitor.visit_enum(self),
            PatternKind::Bitfield { .. } => visitor.visit_bitfield(self),
            PatternKind::BitfieldField { .. } => visitor.visit_bitfield_field(self),
            PatternKind::Struct { .. } => visitor.visit_struct(self),
            PatternKind::Union { .. } => visitor.visit_union(self),
            PatternKind::StaticArray { .. } => visitor.visit_static_array(self),
            PatternKind::DynamicArray { .. } => visitor.visit_dynamic_array(self),
            PatternKind::Pointer { .. } => visitor.visit_pointer(self),
            PatternKind::Padding => visitor.visit_padding(self),
            PatternKind::Error { .. } => visitor.visit_error(self),
        }
    }
}

/// Structural equality: same variant, same offset, same size, same
/// children (recursively). Display metadata does not participate.
impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset && self.size == other.size && self.kind == other.kind
    }
}

/// One method per pattern variant.
pub trait PatternVisitor {
    fn visit_unsigned(&mut self, pattern: &Pattern);
    fn visit_signed(&mut self, pattern: &Pattern);
    fn visit_float(&mut self, pattern: &Pattern);
    fn visit_boolean(&mut self, pattern: &Pattern);
    fn visit_character(&mut self, pattern: &Pattern);
    fn visit_character16(&mut self, pattern: &Pattern);
    fn visit_string(&mut self, pattern: &Pattern);
    fn visit_wide_string(&mut self, pattern: &Pattern);
    fn visit_enum(&mut self, pattern: &Pattern);
    fn visit_bitfield(&mut self, pattern: &Pattern);
    fn visit_bitfield_field(&mut self, pattern: &Pattern);
    fn visit_struct(&mut self, pattern: &Pattern);
    fn visit_union(&mut self, pattern: &Pattern);
    fn visit_static_array(&mut self, pattern: &Pattern);
    fn visit_dynamic_array(&mut self, pattern: &Pattern);
    fn visit_pointer(&mut self, pattern: &Pattern);
    fn visit_padding(&mut self, pattern: &Pattern);
    fn visit_error(&mut self, pattern: &Pattern);
}

/// Extract `bit_size` bits starting at `bit_offset` (LSB-based) from a
/// container value.
pub fn extract_bits(value: u128, bit_offset: u32, bit_size: u32) -> u128 {
    if bit_size == 0 {
        return 0;
    }
    let mask = if bit_size >= 128 {
        u128::MAX
    } else {
        (1u128 << bit_size) - 1
    };
    (value >> bit_offset) & mask
}

/// Decode a scalar pattern's raw bytes into a value. Returns `None` for
/// non-scalar kinds.
pub fn decode_scalar(kind: &PatternKind, bytes: &[u8], endian: Endian) -> Option<Value> {
    let raw = bytes_to_unsigned(bytes, endian);
    Some(match kind {
        PatternKind::Unsigned => Value::Unsigned(raw),
        PatternKind::Signed => Value::Signed(sign_extend(raw, bytes.len() as u32 * 8)),
        PatternKind::Float => match bytes.len() {
            4 => Value::Float(f64::from(f32::from_bits(raw as u32))),
            8 => Value::Float(f64::from_bits(raw as u64)),
            _ => return None,
        },
        PatternKind::Boolean => Value::Bool(raw != 0),
        PatternKind::Character => Value::Char((raw as u8) as char),
        PatternKind::Character16 => Value::Char16(raw as u16),
        _ => return None,
    })
}

/// Assemble bytes into an unsigned integer honoring byte order.
pub fn bytes_to_unsigned(bytes: &[u8], endian: Endian) -> u128 {
    let mut result: u128 = 0;
    match endian {
        Endian::Big => {
            for &b in bytes {
                result = (result << 8) | u128::from(b);
            }
        }
        Endian::Little => {
            for &b in bytes.iter().rev() {
                result = (result << 8) | u128::from(b);
            }
        }
    }
    result
}

/// Sign-extend the low `bits` bits of a raw value.
pub fn sign_extend(raw: u128, bits: u32) -> i128 {
    if bits == 0 || bits >= 128 {
        return raw as i128;
    }
    let shift = 128 - bits;
    ((raw << shift) as i128) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(kind: PatternKind, offset: u64, size: u64) -> Pattern {
        Pattern::new(kind, offset, size, Endian::Little, "u8", "x")
    }

    #[test]
    fn test_bytes_to_unsigned() {
        assert_eq!(
            bytes_to_unsigned(&[0x78, 0x56, 0x34, 0x12], Endian::Little),
            0x1234_5678
        );
        assert_eq!(
            bytes_to_unsigned(&[0x01, 0x02], Endian::Big),
            0x0102
        );
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0xFF, 8), -1);
        assert_eq!(sign_extend(0x7F, 8), 127);
        assert_eq!(sign_extend(0xFFFF_FFFF, 32), -1);
    }

    #[test]
    fn test_extract_bits() {
        assert_eq!(extract_bits(0xA5, 0, 4), 0x5);
        assert_eq!(extract_bits(0xA5, 4, 4), 0xA);
        assert_eq!(extract_bits(u128::MAX, 0, 128), u128::MAX);
    }

    #[test]
    fn test_structural_equality_ignores_metadata() {
        let mut a = leaf(PatternKind::Unsigned, 0, 4);
        let mut b = leaf(PatternKind::Unsigned, 0, 4);
        a.comment = Some("left".to_string());
        b.color = Some(0xFF0000);
        assert_eq!(a, b);

        let c = leaf(PatternKind::Unsigned, 4, 4);
        assert_ne!(a, c);

        let d = leaf(PatternKind::Signed, 0, 4);
        assert_ne!(a, d);
    }

    #[test]
    fn test_static_array_entry() {
        let mut template = leaf(PatternKind::Unsigned, 0, 2);
        template.type_name = "u16".to_string();
        let array = Pattern::new(
            PatternKind::StaticArray {
                template: Box::new(template),
                count: 2,
                data: vec![0x01, 0x00, 0xFF, 0x00],
            },
            0,
            4,
            Endian::Little,
            "u16",
            "arr",
        );

        let first = array.array_entry(0).unwrap();
        assert_eq!(first.value, Some(Value::Unsigned(1)));
        assert_eq!(first.offset, 0);

        let second = array.array_entry(1).unwrap();
        assert_eq!(second.value, Some(Value::Unsigned(0xFF)));
        assert_eq!(second.offset, 2);

        assert!(array.array_entry(2).is_none());
    }

    #[test]
    fn test_error_pattern_formats_message() {
        let err = Pattern::error(0, 1, "broken", "could not decode");
        assert_eq!(err.format_value(), "could not decode");
    }

    #[test]
    fn test_visitor_dispatch() {
        struct Counter {
            unsigned: usize,
            structs: usize,
        }
        impl PatternVisitor for Counter {
            fn visit_unsigned(&mut self, _: &Pattern) {
                self.unsigned += 1;
            }
            fn visit_signed(&mut self, _: &Pattern) {}
            fn visit_float(&mut self, _: &Pattern) {}
            fn visit_boolean(&mut self, _: &Pattern) {}
            fn visit_character(&mut self, _: &Pattern) {}
            fn visit_character16(&mut self, _: &Pattern) {}
            fn visit_string(&mut self, _: &Pattern) {}
            fn visit_wide_string(&mut self, _: &Pattern) {}
            fn visit_enum(&mut self, _: &Pattern) {}
            fn visit_bitfield(&mut self, _: &Pattern) {}
            fn visit_bitfield_field(&mut self, _: &Pattern) {}
            fn visit_struct(&mut self, _: &Pattern) {
                self.structs += 1;
            }
            fn visit_union(&mut self, _: &Pattern) {}
            fn visit_static_array(&mut self, _: &Pattern) {}
            fn visit_dynamic_array(&mut self, _: &Pattern) {}
            fn visit_pointer(&mut self, _: &Pattern) {}
            fn visit_padding(&mut self, _: &Pattern) {}
            fn visit_error(&mut self, _: &Pattern) {}
        }

        let mut counter = Counter {
            unsigned: 0,
            structs: 0,
        };
        let member = leaf(PatternKind::Unsigned, 0, 4);
        let parent = Pattern::new(
            PatternKind::Struct {
                members: vec![member],
            },
            0,
            4,
            Endian::Little,
            "struct S",
            "s",
        );
        parent.accept(&mut counter);
        for child in parent.children() {
            child.accept(&mut counter);
        }
        assert_eq!(counter.structs, 1);
        assert_eq!(counter.unsigned, 1);
    }
}
