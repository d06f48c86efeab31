mod client;

pub use client::{
    CreateDailyReportRequest, CreatePhotoSurveyRequest, ErrorClass, ExecuteWeldRequest,
    RemoteClient, RemoteEntity, RemoteError, SubmitAck, UpdateSpoolPhaseRequest,
    UpdateWeldStatusRequest,
};
