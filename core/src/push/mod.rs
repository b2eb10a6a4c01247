// Push: epidemic dissemination of content to connected neighbors

pub mod candidates;
pub mod engine;
pub mod score;
pub mod service;

pub use candidates::{Admission, CandidateSet};
pub use engine::{interface_id, BrokenSession, DisseminationEngine, EngineDeps, SessionBinding};
pub use score::{
    age_factor, compute_score, quality, relevance, DensityTable, ScoreContext, ScoreModel,
    ScoreSource, ScoreWeights, Scorer, SessionScorer,
};
pub use service::PushService;
