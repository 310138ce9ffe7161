//! Minimal XML handling for WeCom callback bodies.
//!
//! The callback XML is flat and CDATA-wrapped; a tag extractor covers it
//! without a parser dependency.

/// Extract the text content of a top-level tag, unwrapping CDATA.
#[must_use]
pub fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    let content = &xml[start..end];
    let content = content
        .strip_prefix("<![CDATA[")
        .and_then(|c| c.strip_suffix("]]>"))
        .unwrap_or(content);
    Some(content.to_string())
}

/// Build a CDATA-wrapped element.
#[must_use]
pub fn cdata_element(tag: &str, value: &str) -> String {
    format!("<{tag}><![CDATA[{value}]]></{tag}>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_cdata_and_plain_values() {
        let xml = "<xml><MsgType><![CDATA[text]]></MsgType><CreateTime>1700</CreateTime></xml>";
        assert_eq!(extract_tag(xml, "MsgType").as_deref(), Some("text"));
        assert_eq!(extract_tag(xml, "CreateTime").as_deref(), Some("1700"));
        assert_eq!(extract_tag(xml, "Missing"), None);
    }

    #[test]
    fn cdata_element_round_trips() {
        let el = cdata_element("Content", "hello <world>");
        assert_eq!(extract_tag(&el, "Content").as_deref(), Some("hello <world>"));
    }
}
