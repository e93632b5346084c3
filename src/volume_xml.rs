//! Libvirt storage volume XML generation using facet-xml struct serialization.

use facet::Facet;
use facet_xml as xml;
use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::VirtupError;
use crate::image::DiskFormat;

// ── XML model structs ──────────────────────────────────────

#[derive(Debug, Facet)]
#[facet(rename = "volume")]
struct VolumeDef {
    name: String,
    capacity: String,
    allocation: String,
    target: VolumeTarget,
}

#[derive(Debug, Facet)]
struct VolumeTarget {
    format: VolumeFormat,
}

#[derive(Debug, Facet)]
struct VolumeFormat {
    #[facet(xml::attribute)]
    #[facet(rename = "type")]
    kind: String,
}

// ── public API ─────────────────────────────────────────────

/// Generate volume XML for `virStorageVolCreateXML` / `CreateXMLFrom`.
/// Capacity is in bytes; allocation starts at zero so the volume is sparse.
pub fn generate_volume_xml(
    name: &str,
    capacity: u64,
    format: DiskFormat,
) -> Result<String, VirtupError> {
    let vol = VolumeDef {
        name: name.into(),
        capacity: capacity.to_string(),
        allocation: "0".into(),
        target: VolumeTarget {
            format: VolumeFormat {
                kind: format.as_str().into(),
            },
        },
    };

    facet_xml::to_string(&vol).map_err(|e| VirtupError::Validation {
        message: format!("serializing volume XML for '{name}': {e}"),
    })
}

/// Read `<target><format type=.../></target>` out of a volume dump.
/// A volume without a format element is raw.
pub fn format_of(volume_xml: &str) -> Result<DiskFormat, VirtupError> {
    let mut reader = Reader::from_str(volume_xml);
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut format = DiskFormat::Raw;

    loop {
        let (e, opens) = match reader.read_event().map_err(malformed)? {
            Event::Start(e) => (e, true),
            Event::Empty(e) => (e, false),
            Event::End(_) => {
                stack.pop();
                continue;
            }
            Event::Eof => break,
            _ => continue,
        };
        let local = e.local_name().as_ref().to_vec();
        match (stack.as_slice(), local.as_slice()) {
            ([], b"volume") => {}
            ([], other) => {
                return Err(VirtupError::UnexpectedResponse {
                    message: format!(
                        "expected <volume>, found <{}>",
                        String::from_utf8_lossy(other)
                    ),
                });
            }
            ([_, target], b"format") if target == b"target" => {
                for attr in e.attributes() {
                    let attr = attr.map_err(malformed)?;
                    if attr.key.as_ref() == b"type" {
                        format = DiskFormat::from_libvirt(&attr.unescape_value().map_err(malformed)?);
                    }
                }
            }
            _ => {}
        }
        if opens {
            stack.push(local);
        }
    }

    if stack.is_empty() {
        Ok(format)
    } else {
        Err(malformed("unclosed <volume>"))
    }
}

fn malformed(e: impl std::fmt::Display) -> VirtupError {
    VirtupError::UnexpectedResponse {
        message: format!("malformed volume XML: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_xml_has_name_capacity_and_format() {
        let xml = generate_volume_xml("tmpl-base", 8589934592, DiskFormat::Qcow2).unwrap();
        assert!(xml.contains("<name>tmpl-base</name>"));
        assert!(xml.contains("<capacity>8589934592</capacity>"));
        assert!(xml.contains("<allocation>0</allocation>"));
        assert!(xml.contains(r#"type="qcow2""#));
    }

    #[test]
    fn format_of_reads_libvirt_dump() {
        let dump = "<volume type='file'>\n  <name>tmpl-base</name>\n  <target>\n    <format type='qcow2'/>\n  </target>\n</volume>";
        assert_eq!(format_of(dump).unwrap(), DiskFormat::Qcow2);
        assert_eq!(format_of("<volume/>").unwrap(), DiskFormat::Raw);
    }

    #[test]
    fn format_of_only_reads_target_format() {
        let dump = "<volume><backingStore><format type='qcow2'/></backingStore><target><format type='raw'/></target></volume>";
        assert_eq!(format_of(dump).unwrap(), DiskFormat::Raw);
    }

    #[test]
    fn format_of_rejects_other_documents() {
        assert!(matches!(
            format_of(r#"<target><format type="raw"/></target>"#),
            Err(VirtupError::UnexpectedResponse { .. })
        ));
        assert!(format_of("<volume><target>").is_err());
    }
}
