//! Payload encoding and read-time validation.

use serde_json::Value as JsonValue;

use sheetcache_core::InstrumentLink;

use super::types::CURRENT_BUILD_VERSION;

/// Serialize links into the stored payload form.
pub fn encode_payload(links: &[InstrumentLink]) -> Result<String, serde_json::Error> {
    serde_json::to_string(links)
}

/// Decode a stored payload.
///
/// Returns `None` (never an error) when the version tag is not the current one,
/// the text is not JSON, the JSON is not an array, or any element lacks an
/// integral `instrumentId` or a string `instrumentTag`. Callers treat `None` as
/// a cache miss.
///
/// `instrumentId` must be a finite number with no fractional part (`10` and
/// `10.0` pass, `10.5` does not), since ids are stored as `i64`.
pub fn parse_and_validate(payload: &str, build_version: i32) -> Option<Vec<InstrumentLink>> {
    if build_version != CURRENT_BUILD_VERSION {
        return None;
    }

    let value: JsonValue = serde_json::from_str(payload).ok()?;
    let items = value.as_array()?;

    items.iter().map(InstrumentLink::from_json).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Vec<InstrumentLink> {
        vec![
            InstrumentLink::new(10, "PT-101")
                .with_tag_norm("PT101")
                .with_type("pressure transmitter")
                .with_role("primary")
                .with_loop_tags(["L-100", "L-101"]),
            InstrumentLink::new(11, "TT-102"),
        ]
    }

    #[test]
    fn encoded_payload_validates_back_to_the_same_links() {
        let links = sample();
        let payload = encode_payload(&links).unwrap();
        assert_eq!(parse_and_validate(&payload, CURRENT_BUILD_VERSION), Some(links));
    }

    #[test]
    fn wrong_version_is_a_miss() {
        let payload = encode_payload(&sample()).unwrap();
        assert_eq!(parse_and_validate(&payload, CURRENT_BUILD_VERSION + 1), None);
        assert_eq!(parse_and_validate(&payload, 0), None);
    }

    #[test]
    fn malformed_payloads_are_misses() {
        assert_eq!(parse_and_validate("not json", CURRENT_BUILD_VERSION), None);
        assert_eq!(parse_and_validate("{\"instrumentId\":1}", CURRENT_BUILD_VERSION), None);
        assert_eq!(parse_and_validate("42", CURRENT_BUILD_VERSION), None);
        assert_eq!(
            parse_and_validate(
                r#"[{"instrumentId":1,"instrumentTag":"A"},{"instrumentTag":"B"}]"#,
                CURRENT_BUILD_VERSION
            ),
            None
        );
        assert_eq!(
            parse_and_validate(r#"[{"instrumentId":1,"instrumentTag":null}]"#, CURRENT_BUILD_VERSION),
            None
        );
    }

    #[test]
    fn minimal_elements_are_accepted() {
        let links = parse_and_validate(
            r#"[{"instrumentId":7,"instrumentTag":"FT-7"},{"instrumentId":8,"instrumentTag":"FT-8","loopTags":null}]"#,
            CURRENT_BUILD_VERSION,
        )
        .unwrap();

        assert_eq!(links.len(), 2);
        assert_eq!(links[0], InstrumentLink::new(7, "FT-7"));
        assert!(links[1].loop_tags.is_empty());
    }

    #[test]
    fn instrument_id_must_be_integral() {
        let accepted =
            parse_and_validate(r#"[{"instrumentId":10.0,"instrumentTag":"PT-1"}]"#, CURRENT_BUILD_VERSION);
        assert_eq!(accepted, Some(vec![InstrumentLink::new(10, "PT-1")]));

        for id in ["10.5", "\"10\"", "null", "1e400"] {
            let payload = format!(r#"[{{"instrumentId":{id},"instrumentTag":"PT-1"}}]"#);
            assert_eq!(parse_and_validate(&payload, CURRENT_BUILD_VERSION), None, "{id}");
        }
    }

    #[test]
    fn empty_array_is_a_valid_empty_snapshot() {
        assert_eq!(parse_and_validate("[]", CURRENT_BUILD_VERSION), Some(Vec::new()));
    }

    fn link_strategy() -> impl Strategy<Value = InstrumentLink> {
        (
            any::<i64>(),
            "[A-Z]{2}-[0-9]{1,4}",
            proptest::option::of("[A-Z0-9]{1,8}"),
            proptest::option::of("[a-z ]{1,16}"),
            proptest::option::of("primary|secondary"),
            proptest::collection::vec("L-[0-9]{1,3}", 0..4),
        )
            .prop_map(|(id, tag, tag_norm, instrument_type, link_role, loop_tags)| InstrumentLink {
                instrument_id: id,
                instrument_tag: tag,
                instrument_tag_norm: tag_norm,
                instrument_type,
                link_role,
                loop_tags,
            })
    }

    proptest! {
        #[test]
        fn encoded_links_always_validate(links in proptest::collection::vec(link_strategy(), 0..20)) {
            let payload = encode_payload(&links).unwrap();
            prop_assert_eq!(parse_and_validate(&payload, CURRENT_BUILD_VERSION), Some(links));
        }

        #[test]
        fn any_other_version_is_a_miss(
            links in proptest::collection::vec(link_strategy(), 0..5),
            version in any::<i32>().prop_filter("not current", |v| *v != CURRENT_BUILD_VERSION),
        ) {
            let payload = encode_payload(&links).unwrap();
            prop_assert_eq!(parse_and_validate(&payload, version), None);
        }
    }
}
