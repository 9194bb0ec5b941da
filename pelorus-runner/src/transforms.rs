//! Record transforms, applied in declaration order between read and write.

use crate::spec::TransformStage;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub fn apply(transforms: &[TransformStage], record: String) -> String {
    let mut record = record;
    for transform in transforms {
        record = match transform {
            TransformStage::Timestamp => format!("{} {record}", now_rfc3339()),
            TransformStage::Prefix { prefix } => format!("{prefix} {record}"),
        };
    }
    record
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::new())
}
