//! Container identification and top-level opening
//!
//! Three AFF4 generations exist in the wild. A `version.txt` member marks
//! the AFF4 Standard; otherwise the namespace declared in the Turtle
//! metadata separates the Scudette/Rekall variant from pre-standard
//! Evimetry containers.

use aff4_core::lexicon;
use aff4_core::{Error, Lexicon, RdfValue, Result, Urn};

use crate::resolver::Resolver;
use crate::zip::ZipVolume;

/// An opened container: the resolver holding all metadata plus the URNs a
/// caller needs to read the evidence.
pub struct OpenedContainer {
    pub resolver: Resolver,
    pub lexicon: Lexicon,
    pub volume_urn: Urn,
    /// The declared top-level image subject, when the container has one.
    pub image_urn: Option<Urn>,
    /// The stream to read the evidence through (a map stream).
    pub stream_urn: Urn,
}

pub struct Container;

impl Container {
    /// Identify a filename as an AFF4 container.
    pub fn identify(filename: &str) -> Result<Lexicon> {
        Self::identify_urn(&Urn::from_filename(filename))
    }

    pub fn identify_urn(urn: &Urn) -> Result<Lexicon> {
        let resolver = Resolver::new(Lexicon::Standard);
        let volume = ZipVolume::create(&resolver, urn)?;
        let mut object = volume.borrow_mut();
        let zip = object.as_volume()?;

        if zip.member_names().is_empty() {
            // A brand new zip file.
            return Err(Error::not_found(format!("{} is not an AFF4 volume", urn)));
        }

        if zip.has_member(lexicon::AFF4_CONTAINER_VERSION_TXT) {
            // AFF4 Standard v1.0 introduced the version file.
            return Ok(Lexicon::Standard);
        }

        if resolver.aff4_namespace().as_deref() == Some(lexicon::AFF4_NAMESPACE) {
            // Rekall defined the new namespace post the Wirespeed paper.
            Ok(Lexicon::Scudette)
        } else {
            // Evimetry 1.x/2.x stayed with the original namespace.
            Ok(Lexicon::Legacy)
        }
    }

    /// Open a filename as an AFF4 container.
    pub fn open(filename: &str) -> Result<OpenedContainer> {
        Self::open_urn(&Urn::from_filename(filename))
    }

    pub fn open_urn(urn: &Urn) -> Result<OpenedContainer> {
        let flavor = Self::identify_urn(urn)?;
        let resolver = Resolver::new(flavor);
        let volume_urn = {
            let volume = ZipVolume::create(&resolver, urn)?;
            volume.urn()
        };

        let (image_urn, stream_urn) = match flavor {
            Lexicon::Standard => Self::locate_standard_stream(&resolver, flavor)?,
            Lexicon::Scudette => Self::locate_scudette_stream(&resolver, flavor)?,
            Lexicon::Legacy => Self::locate_legacy_stream(&resolver, flavor)?,
        };

        Ok(OpenedContainer {
            resolver,
            lexicon: flavor,
            volume_urn,
            image_urn,
            stream_urn,
        })
    }

    /// Standard: the declared Image subject names its data streams; pick
    /// the one that is a map.
    fn locate_standard_stream(
        resolver: &Resolver,
        flavor: Lexicon,
    ) -> Result<(Option<Urn>, Urn)> {
        let image_type = RdfValue::Urn(Urn::new(flavor.image_type()));
        let image = resolver
            .query_predicate_object(lexicon::AFF4_TYPE, &image_type)
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("container declares no Image".to_string()))?;

        let map_type = RdfValue::Urn(Urn::new(flavor.map_type()));
        for value in resolver.query_subject_predicate(&image, &flavor.data_stream()) {
            if let Some(stream) = value.as_urn() {
                if resolver
                    .query_subject_predicate(&stream, lexicon::AFF4_TYPE)
                    .contains(&map_type)
                {
                    return Ok((Some(image), stream));
                }
            }
        }
        Err(Error::not_found(
            "container has no map data stream".to_string(),
        ))
    }

    /// Scudette: the physical-memory map is the top-level stream; its
    /// `information.yaml` carries the page-table and KASLR metadata.
    fn locate_scudette_stream(
        resolver: &Resolver,
        flavor: Lexicon,
    ) -> Result<(Option<Urn>, Urn)> {
        let map_type = RdfValue::Urn(Urn::new(flavor.map_type()));
        for map in resolver.query_predicate_object(lexicon::AFF4_TYPE, &map_type) {
            let category = resolver
                .query_subject_predicate(&map, &flavor.category())
                .into_iter()
                .next();
            let is_physical = matches!(
                category,
                Some(RdfValue::Urn(ref urn)) if urn.as_str() == flavor.memory_physical()
            ) || matches!(
                category,
                Some(RdfValue::String(ref s)) if s == &flavor.memory_physical()
            );
            if !is_physical {
                continue;
            }

            Self::load_scudette_metadata(resolver, &map, flavor);
            return Ok((Some(map.clone()), map));
        }
        Err(Error::not_found(
            "container has no physical memory map".to_string(),
        ))
    }

    /// Pre-standard: the Image subject is itself the map stream.
    fn locate_legacy_stream(resolver: &Resolver, flavor: Lexicon) -> Result<(Option<Urn>, Urn)> {
        let image_type = RdfValue::Urn(Urn::new(flavor.image_type()));
        let map_type = RdfValue::Urn(Urn::new(flavor.map_type()));

        for image in resolver.query_predicate_object(lexicon::AFF4_TYPE, &image_type) {
            if resolver
                .query_subject_predicate(&image, lexicon::AFF4_TYPE)
                .contains(&map_type)
            {
                return Ok((Some(image.clone()), image));
            }
        }
        Err(Error::not_found(
            "container declares no map image".to_string(),
        ))
    }

    /// Best-effort extraction of `CR3` and `kaslr_slide` from the map's
    /// `information.yaml`. Absent values are simply skipped.
    fn load_scudette_metadata(resolver: &Resolver, map: &Urn, flavor: Lexicon) {
        let yaml_urn = map.append(lexicon::AFF4_CONTAINER_INFO_YAML);
        let guard = match resolver.open(&yaml_urn) {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let text = {
            let mut object = guard.borrow_mut();
            let size = match object.size(resolver) {
                Ok(size) => size as usize,
                Err(_) => return,
            };
            match object.read(resolver, size) {
                Ok(data) => String::from_utf8_lossy(&data).into_owned(),
                Err(_) => return,
            }
        };

        if let Some(cr3) = scan_yaml_integer(&text, "CR3") {
            resolver.add(
                map,
                &flavor.memory_page_table_entry_offset(),
                RdfValue::Integer(cr3),
            );
        }
        if let Some(slide) = scan_yaml_integer(&text, "kaslr_slide") {
            resolver.add(map, &flavor.osx_kaslr_slide(), RdfValue::Integer(slide));
        }
    }
}

/// Pull a single `key: value` integer out of a YAML document. The two
/// fields we need are plain scalars, which a line scan covers.
fn scan_yaml_integer(text: &str, key: &str) -> Option<i64> {
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix(key) {
            let value = value.trim_start();
            if let Some(value) = value.strip_prefix(':') {
                let value = value.trim();
                if let Some(hex) = value.strip_prefix("0x") {
                    if let Ok(parsed) = i64::from_str_radix(hex, 16) {
                        return Some(parsed);
                    }
                }
                if let Ok(parsed) = value.parse::<i64>() {
                    return Some(parsed);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_yaml_integer() {
        let yaml = "Registers:\n  CR3: 18446744071\n  RIP: 1\nkaslr_slide: 0x2000000\n";
        assert_eq!(scan_yaml_integer(yaml, "CR3"), Some(18446744071));
        assert_eq!(scan_yaml_integer(yaml, "kaslr_slide"), Some(0x2000000));
        assert_eq!(scan_yaml_integer(yaml, "missing"), None);
    }

    #[test]
    fn test_identify_missing_file_fails() {
        let result = Container::identify("/nonexistent/path/evidence.aff4");
        assert!(result.is_err());
    }

    use crate::map::MapStream;

    /// Write a standard container holding a declared Image whose data
    /// stream is a map.
    fn write_standard_container(path: &str) -> Urn {
        let backing = Urn::from_filename(path);
        let resolver = Resolver::new(Lexicon::Standard);
        resolver.set(
            &backing,
            lexicon::AFF4_STREAM_WRITE_MODE,
            RdfValue::from("truncate"),
        );

        let volume = ZipVolume::create(&resolver, &backing).unwrap();
        let volume_urn = volume.urn();
        let map_urn = volume_urn.append("disk.map");
        {
            let map = MapStream::create(&resolver, &map_urn, &volume_urn).unwrap();
            let mut object = map.borrow_mut();
            object.write(&resolver, b"MBR and partitions").unwrap();
        }

        // Declare the top-level Image subject the way acquisition tools do.
        let image_subject = volume_urn.append("disk");
        resolver.set(
            &image_subject,
            lexicon::AFF4_TYPE,
            RdfValue::Urn(Urn::new(Lexicon::Standard.image_type())),
        );
        resolver.add(
            &image_subject,
            &Lexicon::Standard.data_stream(),
            RdfValue::Urn(map_urn),
        );

        drop(volume);
        resolver.flush().unwrap();
        backing
    }

    #[test]
    fn test_identify_and_open_standard_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("standard.aff4");
        let backing = write_standard_container(path.to_str().unwrap());

        assert_eq!(
            Container::identify_urn(&backing).unwrap(),
            Lexicon::Standard
        );

        let opened = Container::open_urn(&backing).unwrap();
        assert_eq!(opened.lexicon, Lexicon::Standard);
        assert!(opened.image_urn.is_some());

        let stream = opened.resolver.open(&opened.stream_urn).unwrap();
        let mut object = stream.borrow_mut();
        let data = object.read(&opened.resolver, 18).unwrap();
        assert_eq!(data, b"MBR and partitions");
    }
}
