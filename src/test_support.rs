//! Deterministic fixtures for tests (§14), mirroring the teacher's
//! `test_utils.rs` pattern of fixed base timestamps instead of wall-clock
//! time.

use lazy_static::lazy_static;

lazy_static! {
    /// 2014-09-16T19:11:45Z in epoch milliseconds, used throughout the
    /// test suite so fixtures don't depend on when they're run.
    pub static ref BASE_TIMESTAMP_MS: i64 = 1_410_894_705_000;
}

/// A minimal single-call `<calls>` document for the given number/year.
pub fn single_call_xml(number: &str, timestamp_ms: i64, kind_code: i32) -> String {
    format!(
        r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<calls count="1">
  <call number="{number}" duration="0" date="{timestamp_ms}" type="{kind_code}" readable_date="test" contact_name="null" />
</calls>"#
    )
}

/// A minimal single-SMS `<smses>` document.
pub fn single_sms_xml(address: &str, timestamp_ms: i64, body: &str) -> String {
    format!(
        r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<smses count="1">
  <sms protocol="0" address="{address}" date="{timestamp_ms}" type="1" subject="null" body="{body}" service_center="null" read="1" status="-1" locked="0" date_sent="{timestamp_ms}" readable_date="test" contact_name="null" />
</smses>"#
    )
}

/// A single MMS with one oversized PNG part (eligible for extraction) and
/// one small inline text part.
pub fn mms_with_image_and_text_xml(timestamp_ms: i64, png_base64: &str) -> String {
    format!(
        r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<smses count="1">
<mms date="{timestamp_ms}" msg_box="1" address="+15555550000" m_type="128" m_id="1" thread_id="1">
  <parts>
    <part seq="0" ct="application/smil" name="smil.xml" text="&lt;smil/&gt;"/>
    <part seq="1" ct="image/png" name="image.png" fn="image.png" data="{png_base64}"/>
  </parts>
  <addrs>
    <addr address="+15555550000" type="137" charset="106"/>
  </addrs>
</mms>
</smses>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_are_well_formed_enough_to_parse() {
        let xml = single_call_xml("+1", *BASE_TIMESTAMP_MS, 1);
        assert!(xml.contains("count=\"1\""));
    }
}
