pub mod byteset;
pub mod collector;
pub mod config;
pub mod dictionary;
pub mod feature;
pub mod torc;

pub use byteset::{ByteSet, ConcurrentByteSet, LayeredByteSet};
pub use collector::{
    collect_counter_features, collect_pc_features, decode_feature_batch, domain_breakdown,
    encode_cmp_observation, encode_feature_batch, push_user_feature, CollectorError,
    UserDomainMask,
};
pub use config::SpoorConfig;
pub use dictionary::{ContainerDictionary, DictionaryEntry, IntegerDictionary};
pub use feature::{
    ab_to_cmp_difflog, ab_to_cmp_hamming, ab_to_cmp_moddiff, convert_8bit_counter_to_number,
    convert_pc_feature_to_pc_index, convert_pc_pair_to_number, domains, Domain, Feature,
    FeatureArray, FeatureVec,
};
pub use torc::{
    BufferTorc, CmpOperand, CompareEntry, ComparedBufferEntry, TableOfRecentCompares,
    TablesOfRecentCompares,
};
