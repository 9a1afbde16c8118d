//! Attribute dictionary
//!
//! Maps attribute names to wire codes and data types, including
//! vendor-specific entries keyed by `(vendor-id, vendor-code)`.
//!
//! The dictionary is loaded once at startup and shared behind an `Arc`;
//! nothing mutates it while packets are being processed.
//!
//! Files use the FreeRADIUS syntax:
//!
//! ```text
//! ATTRIBUTE   User-Name           1   string
//! ATTRIBUTE   Tunnel-Type         64  integer has_tag
//! VENDOR      Microsoft           311
//! BEGIN-VENDOR Microsoft
//! ATTRIBUTE   MS-CHAP2-Response   25  octets
//! END-VENDOR  Microsoft
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

const DEFAULT_DICTIONARY: &str = include_str!("../dictionary/default.dictionary");

#[derive(Error, Debug)]
pub enum DictionaryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("Line {line}: unknown vendor '{vendor}'")]
    UnknownVendor { line: usize, vendor: String },
}

/// Wire data type of an attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    String,
    TaggedString,
    Integer,
    TaggedInteger,
    IpAddr,
    Octets,
}

impl DataType {
    fn parse(type_name: &str, tagged: bool) -> Self {
        let base = match type_name.to_ascii_lowercase().as_str() {
            "string" | "text" => DataType::String,
            "tagged-string" => DataType::TaggedString,
            "integer" | "date" | "time" => DataType::Integer,
            "tagged-integer" => DataType::TaggedInteger,
            "ipaddr" => DataType::IpAddr,
            "octets" | "octet" => DataType::Octets,
            other => {
                debug!(data_type = other, "Treating unsupported dictionary type as octets");
                DataType::Octets
            }
        };

        match (base, tagged) {
            (DataType::String, true) => DataType::TaggedString,
            (DataType::Integer, true) => DataType::TaggedInteger,
            (base, _) => base,
        }
    }
}

/// One attribute definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictionaryAttribute {
    /// Canonical attribute name (e.g. "User-Name")
    pub name: String,
    /// Attribute type, or vendor type for vendor-specific entries
    pub code: u8,
    /// IANA private enterprise number for vendor-specific entries
    pub vendor_id: Option<u32>,
    pub data_type: DataType,
}

/// Immutable attribute dictionary
#[derive(Debug, Clone, Default)]
pub struct AttributeDictionary {
    /// Lower-cased name -> definition
    by_name: HashMap<String, DictionaryAttribute>,
    by_code: HashMap<u8, String>,
    by_vendor_code: HashMap<(u32, u8), String>,
    vendors: HashMap<String, u32>,
}

impl AttributeDictionary {
    /// The RFC 2865/2866/2868/2869 attributes plus common vendor entries
    pub fn builtin() -> Result<Self, DictionaryError> {
        let mut dictionary = Self::default();
        dictionary.merge_str(DEFAULT_DICTIONARY)?;
        Ok(dictionary)
    }

    /// Built-in dictionary with a dictionary file merged on top
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DictionaryError> {
        let mut dictionary = Self::builtin()?;
        let contents = fs::read_to_string(path)?;
        dictionary.merge_str(&contents)?;
        Ok(dictionary)
    }

    /// Parse dictionary text and merge its entries, later entries replacing
    /// earlier ones with the same name
    pub fn merge_str(&mut self, contents: &str) -> Result<(), DictionaryError> {
        let mut current_vendor: Option<u32> = None;

        for (index, raw_line) in contents.lines().enumerate() {
            let line_no = index + 1;
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens[0].to_ascii_uppercase().as_str() {
                "VENDOR" => {
                    let (name, id) = match tokens.as_slice() {
                        [_, name, id, ..] => (name, id),
                        _ => return Err(syntax(line_no, "VENDOR needs a name and an id")),
                    };
                    let id = id
                        .parse::<u32>()
                        .map_err(|_| syntax(line_no, format!("invalid vendor id '{}'", id)))?;
                    self.vendors.insert(name.to_string(), id);
                }
                "BEGIN-VENDOR" => {
                    let name = tokens
                        .get(1)
                        .ok_or_else(|| syntax(line_no, "BEGIN-VENDOR needs a vendor name"))?;
                    current_vendor = Some(self.vendor_id(name, line_no)?);
                }
                "END-VENDOR" => current_vendor = None,
                "ATTRIBUTE" => {
                    let (name, code, type_name, rest) = match tokens.as_slice() {
                        [_, name, code, type_name, rest @ ..] => (*name, *code, *type_name, rest),
                        _ => {
                            return Err(syntax(line_no, "ATTRIBUTE needs a name, a code and a type"))
                        }
                    };
                    let code = code
                        .parse::<u8>()
                        .map_err(|_| syntax(line_no, format!("invalid attribute code '{}'", code)))?;

                    let mut tagged = false;
                    let mut vendor_id = current_vendor;
                    for extra in rest {
                        if extra.split(',').any(|flag| flag == "has_tag") {
                            tagged = true;
                        } else if !extra.contains('=') {
                            // Old-style trailing vendor name
                            vendor_id = Some(self.vendor_id(extra, line_no)?);
                        }
                    }

                    self.insert(DictionaryAttribute {
                        name: name.to_string(),
                        code,
                        vendor_id,
                        data_type: DataType::parse(type_name, tagged),
                    });
                }
                "VALUE" | "$INCLUDE" | "PROTOCOL" | "FLAGS" => {}
                other => {
                    debug!(line = line_no, keyword = other, "Ignoring unknown dictionary keyword");
                }
            }
        }

        Ok(())
    }

    fn vendor_id(&self, name: &str, line: usize) -> Result<u32, DictionaryError> {
        self.vendors
            .get(name)
            .copied()
            .ok_or_else(|| DictionaryError::UnknownVendor {
                line,
                vendor: name.to_string(),
            })
    }

    fn insert(&mut self, attribute: DictionaryAttribute) {
        match attribute.vendor_id {
            Some(vendor_id) => {
                self.by_vendor_code
                    .insert((vendor_id, attribute.code), attribute.name.clone());
            }
            None => {
                self.by_code.insert(attribute.code, attribute.name.clone());
            }
        }
        self.by_name
            .insert(attribute.name.to_ascii_lowercase(), attribute);
    }

    /// Look up an attribute by name (case-insensitive)
    pub fn find_by_name(&self, name: &str) -> Option<&DictionaryAttribute> {
        self.by_name.get(&name.to_ascii_lowercase())
    }

    /// Look up a standard attribute by type code
    pub fn find_by_code(&self, code: u8) -> Option<&DictionaryAttribute> {
        self.by_code
            .get(&code)
            .and_then(|name| self.find_by_name(name))
    }

    /// Look up a vendor-specific attribute
    pub fn find_vendor_attribute(&self, vendor_id: u32, vendor_code: u8) -> Option<&DictionaryAttribute> {
        self.by_vendor_code
            .get(&(vendor_id, vendor_code))
            .and_then(|name| self.find_by_name(name))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

fn syntax(line: usize, message: impl Into<String>) -> DictionaryError {
    DictionaryError::Syntax {
        line,
        message: message.into(),
    }
}
