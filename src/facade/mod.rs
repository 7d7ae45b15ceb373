pub mod requests;
pub mod store;

pub use requests::{
    FindAndOccupyRequest, ImportOutcome, ImportRequest, OccupyRequest, ReleaseRequest, RowPage,
    RowQuery, RowsRequest, SqlImportRequest, TableTarget,
};
pub use store::{StoreBuilder, TestDataStore};
