//! Local CID reformatting between v0/base58btc and v1/base32.

use cid::multibase::Base;
use cid::{Cid, Version};

use crate::error::{NodeError, NodeResult};

/// Multicodec for dag-pb, the only codec representable as CIDv0.
/// <https://github.com/multiformats/multicodec/blob/master/table.csv>
const DAG_PB: u64 = 0x70;

pub type CidVersion = Version;
pub type CidBase = Base;

/// Reformat `input` to the requested version and base. Converting to v0
/// requires a dag-pb CID with a sha2-256 multihash; anything else is a
/// protocol error, mirroring the node's own `cid/format` behavior.
pub fn format_cid(input: &str, version: Version, base: Base) -> NodeResult<String> {
    let cid = Cid::try_from(input)
        .map_err(|error| NodeError::Protocol(format!("invalid CID {:?}: {}", input, error)))?;

    match version {
        Version::V0 => {
            if cid.codec() != DAG_PB {
                return Err(NodeError::Protocol(format!(
                    "codec {:#x} has no v0 representation",
                    cid.codec()
                )));
            }
            let v0 = Cid::new_v0(cid.hash().to_owned())
                .map_err(|error| NodeError::Protocol(error.to_string()))?;
            Ok(v0.to_string())
        }
        Version::V1 => {
            let v1 = Cid::new_v1(cid.codec(), cid.hash().to_owned());
            v1.to_string_of_base(base)
                .map_err(|error| NodeError::Protocol(error.to_string()))
        }
    }
}

/// Shorthand for the common pair returned by the public CID endpoints.
pub fn v0_and_v1(input: &str) -> (Option<String>, Option<String>) {
    let v0 = format_cid(input, Version::V0, Base::Base58Btc).ok();
    let v1 = format_cid(input, Version::V1, Base::Base32Lower).ok();
    (v0, v1)
}

#[cfg(test)]
mod tests {
    use super::*;

    // A dag-pb CID in both of its representations.
    const V0: &str = "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n";
    const V1: &str = "bafybeihdwdcefgh4dqkjv67uzcmw7ojee6xedzdetojuzjevtenxquvyku";

    #[test]
    fn v0_to_v1_and_back_is_identity_for_dag_pb() {
        let v1 = format_cid(V0, Version::V1, Base::Base32Lower).unwrap();
        assert_eq!(v1, V1);
        let v0 = format_cid(&v1, Version::V0, Base::Base58Btc).unwrap();
        assert_eq!(v0, V0);
    }

    #[test]
    fn non_dag_pb_cids_have_no_v0_form() {
        // A raw-codec CIDv1 cannot be rendered as v0.
        let raw = "bafkreigh2akiscaildcqabsyg3dfr6chu3fgpregiymsck7e7aqa4s52zy";
        assert!(format_cid(raw, Version::V0, Base::Base58Btc).is_err());
        assert!(format_cid(raw, Version::V1, Base::Base32Lower).is_ok());
    }

    #[test]
    fn invalid_input_is_a_protocol_error() {
        match format_cid("not-a-cid", Version::V1, Base::Base32Lower) {
            Err(NodeError::Protocol(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
