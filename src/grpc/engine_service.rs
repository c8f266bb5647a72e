//! SzEngine gRPC handler: record ingestion, entity queries and exports.
//!
//! The two `StreamExport*` RPCs open an export, then fetch one row per
//! engine step into a bounded channel. The last message carries
//! `done = true`. A client that drops the stream stops the fetch loop
//! after the row in flight, and the export is closed either way.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use super::support::{wire_id, ServiceCore, SubdomainService, HANDLER_MESSAGES};
use crate::engine::{EngineBinding, SzEngine};
use crate::observability::MessageLogger;
use crate::observer::ObserverRegistry;
use crate::proto::szengine::sz_engine_server::SzEngine as SzEngineRpc;
use crate::proto::szengine::*;
use crate::types::{ConfigId, EntityId, Error, ExportHandle};

pub const ENGINE_COMPONENT_ID: u32 = 6014;

#[derive(Debug)]
pub struct EngineService {
    core: ServiceCore<dyn SzEngine>,
    stream_capacity: usize,
}

impl EngineService {
    pub fn new(binding: Arc<EngineBinding<dyn SzEngine>>, stream_capacity: usize) -> Self {
        Self {
            core: ServiceCore::new(
                MessageLogger::new(ENGINE_COMPONENT_ID, "szengineserver.", HANDLER_MESSAGES),
                binding,
            ),
            stream_capacity: stream_capacity.max(1),
        }
    }

    /// Drain an open export into a stream of `make(row, done)` messages.
    fn export_stream<M>(
        &self,
        handle: ExportHandle,
        make: fn(String, bool) -> M,
    ) -> ReceiverStream<std::result::Result<M, Status>>
    where
        M: Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.stream_capacity);
        let binding = Arc::clone(self.core.binding());
        let span = tracing::debug_span!("export_stream", export_handle = handle.get());

        tokio::spawn(tracing::Instrument::instrument(
            async move {
                let mut rows = 0usize;
                let mut cancelled = false;
                loop {
                    if tx.is_closed() {
                        cancelled = true;
                        break;
                    }
                    let fetch = Arc::clone(&binding);
                    let row = tokio::task::spawn_blocking(move || fetch.get()?.fetch_next(handle))
                        .await
                        .unwrap_or_else(|join| Err(Error::from(join)));
                    match row {
                        Ok(row) if row.is_empty() => {
                            let _ = tx.send(Ok(make(String::new(), true))).await;
                            break;
                        }
                        Ok(row) => {
                            rows += 1;
                            if tx.send(Ok(make(row, false))).await.is_err() {
                                cancelled = true;
                                break;
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(Err(Status::from(err))).await;
                            break;
                        }
                    }
                }

                let close = Arc::clone(&binding);
                let closed = tokio::task::spawn_blocking(move || close.get()?.close_export(handle))
                    .await
                    .unwrap_or_else(|join| Err(Error::from(join)));
                if let Err(err) = closed {
                    tracing::warn!(error = %err, "Failed to close export");
                }
                tracing::debug!(rows, cancelled, "Export stream finished");
            },
            span,
        ));

        ReceiverStream::new(rx)
    }
}

#[async_trait]
impl SubdomainService for EngineService {
    fn logger(&self) -> &Arc<MessageLogger> {
        self.core.logger()
    }

    fn observers(&self) -> &ObserverRegistry {
        self.core.binding().observers()
    }
}

#[tonic::async_trait]
impl SzEngineRpc for EngineService {
    async fn add_record(
        &self,
        request: Request<AddRecordRequest>,
    ) -> std::result::Result<Response<AddRecordResponse>, Status> {
        let req = request.into_inner();
        let (code, id, definition, flags) = (
            req.data_source_code.clone(),
            req.record_id.clone(),
            req.record_definition.clone(),
            req.flags,
        );
        let result = self
            .core
            .call(
                1,
                "AddRecord",
                &req,
                json!({ "dataSourceCode": code, "recordId": id, "flags": flags }),
                move |engine| engine.add_record(&code, &id, &definition, flags),
            )
            .await?;
        Ok(Response::new(AddRecordResponse { result }))
    }

    async fn close_export(
        &self,
        request: Request<CloseExportRequest>,
    ) -> std::result::Result<Response<CloseExportResponse>, Status> {
        let req = request.into_inner();
        let handle = req.export_handle;
        self.core
            .call(3, "CloseExport", &req, json!({ "exportHandle": handle }), move |engine| {
                engine.close_export(wire_id(handle, ExportHandle::new)?)
            })
            .await?;
        Ok(Response::new(CloseExportResponse {}))
    }

    async fn count_redo_records(
        &self,
        request: Request<CountRedoRecordsRequest>,
    ) -> std::result::Result<Response<CountRedoRecordsResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .core
            .call(5, "CountRedoRecords", &req, json!({}), |engine| engine.count_redo_records())
            .await?;
        Ok(Response::new(CountRedoRecordsResponse { result }))
    }

    async fn delete_record(
        &self,
        request: Request<DeleteRecordRequest>,
    ) -> std::result::Result<Response<DeleteRecordResponse>, Status> {
        let req = request.into_inner();
        let (code, id, flags) = (req.data_source_code.clone(), req.record_id.clone(), req.flags);
        let result = self
            .core
            .call(
                7,
                "DeleteRecord",
                &req,
                json!({ "dataSourceCode": code, "recordId": id, "flags": flags }),
                move |engine| engine.delete_record(&code, &id, flags),
            )
            .await?;
        Ok(Response::new(DeleteRecordResponse { result }))
    }

    async fn export_csv_entity_report(
        &self,
        request: Request<ExportCsvEntityReportRequest>,
    ) -> std::result::Result<Response<ExportCsvEntityReportResponse>, Status> {
        let req = request.into_inner();
        let (columns, flags) = (req.csv_column_list.clone(), req.flags);
        let handle = self
            .core
            .call(
                9,
                "ExportCsvEntityReport",
                &req,
                json!({ "csvColumnList": columns, "flags": flags }),
                move |engine| engine.export_csv_entity_report(&columns, flags),
            )
            .await?;
        Ok(Response::new(ExportCsvEntityReportResponse {
            result: handle.get(),
        }))
    }

    async fn export_json_entity_report(
        &self,
        request: Request<ExportJsonEntityReportRequest>,
    ) -> std::result::Result<Response<ExportJsonEntityReportResponse>, Status> {
        let req = request.into_inner();
        let flags = req.flags;
        let handle = self
            .core
            .call(11, "ExportJsonEntityReport", &req, json!({ "flags": flags }), move |engine| {
                engine.export_json_entity_report(flags)
            })
            .await?;
        Ok(Response::new(ExportJsonEntityReportResponse {
            result: handle.get(),
        }))
    }

    async fn fetch_next(
        &self,
        request: Request<FetchNextRequest>,
    ) -> std::result::Result<Response<FetchNextResponse>, Status> {
        let req = request.into_inner();
        let handle = req.export_handle;
        let result = self
            .core
            .call(13, "FetchNext", &req, json!({ "exportHandle": handle }), move |engine| {
                engine.fetch_next(wire_id(handle, ExportHandle::new)?)
            })
            .await?;
        Ok(Response::new(FetchNextResponse { result }))
    }

    async fn find_network_by_entity_id(
        &self,
        request: Request<FindNetworkByEntityIdRequest>,
    ) -> std::result::Result<Response<FindNetworkByEntityIdResponse>, Status> {
        let req = request.into_inner();
        let entity_ids = req.entity_ids.clone();
        let (max_degrees, build_out, max_entities, flags) = (
            req.max_degrees,
            req.build_out_degrees,
            req.build_out_max_entities,
            req.flags,
        );
        let result = self
            .core
            .call(
                15,
                "FindNetworkByEntityId",
                &req,
                json!({
                    "entityIds": entity_ids,
                    "maxDegrees": max_degrees,
                    "buildOutDegrees": build_out,
                    "buildOutMaxEntities": max_entities,
                    "flags": flags,
                }),
                move |engine| {
                    engine.find_network_by_entity_id(
                        &entity_ids,
                        max_degrees,
                        build_out,
                        max_entities,
                        flags,
                    )
                },
            )
            .await?;
        Ok(Response::new(FindNetworkByEntityIdResponse { result }))
    }

    async fn find_path_by_entity_id(
        &self,
        request: Request<FindPathByEntityIdRequest>,
    ) -> std::result::Result<Response<FindPathByEntityIdResponse>, Status> {
        let req = request.into_inner();
        let (start, end, max_degrees, flags) =
            (req.start_entity_id, req.end_entity_id, req.max_degrees, req.flags);
        let avoid = req.avoid_entity_ids.clone();
        let result = self
            .core
            .call(
                17,
                "FindPathByEntityId",
                &req,
                json!({
                    "startEntityId": start,
                    "endEntityId": end,
                    "maxDegrees": max_degrees,
                    "flags": flags,
                }),
                move |engine| {
                    engine.find_path_by_entity_id(
                        wire_id(start, EntityId::new)?,
                        wire_id(end, EntityId::new)?,
                        max_degrees,
                        &avoid,
                        flags,
                    )
                },
            )
            .await?;
        Ok(Response::new(FindPathByEntityIdResponse { result }))
    }

    async fn find_path_by_record_id(
        &self,
        request: Request<FindPathByRecordIdRequest>,
    ) -> std::result::Result<Response<FindPathByRecordIdResponse>, Status> {
        let req = request.into_inner();
        let (start_code, start_id, end_code, end_id) = (
            req.start_data_source_code.clone(),
            req.start_record_id.clone(),
            req.end_data_source_code.clone(),
            req.end_record_id.clone(),
        );
        let (max_degrees, flags) = (req.max_degrees, req.flags);
        let result = self
            .core
            .call(
                19,
                "FindPathByRecordId",
                &req,
                json!({
                    "startDataSourceCode": start_code,
                    "startRecordId": start_id,
                    "endDataSourceCode": end_code,
                    "endRecordId": end_id,
                    "maxDegrees": max_degrees,
                    "flags": flags,
                }),
                move |engine| {
                    engine.find_path_by_record_id(
                        &start_code,
                        &start_id,
                        &end_code,
                        &end_id,
                        max_degrees,
                        flags,
                    )
                },
            )
            .await?;
        Ok(Response::new(FindPathByRecordIdResponse { result }))
    }

    async fn get_active_config_id(
        &self,
        request: Request<GetActiveConfigIdRequest>,
    ) -> std::result::Result<Response<GetActiveConfigIdResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .core
            .call(21, "GetActiveConfigId", &req, json!({}), |engine| {
                engine.get_active_config_id()
            })
            .await?;
        Ok(Response::new(GetActiveConfigIdResponse { result }))
    }

    async fn get_entity_by_entity_id(
        &self,
        request: Request<GetEntityByEntityIdRequest>,
    ) -> std::result::Result<Response<GetEntityByEntityIdResponse>, Status> {
        let req = request.into_inner();
        let (entity_id, flags) = (req.entity_id, req.flags);
        let result = self
            .core
            .call(
                23,
                "GetEntityByEntityId",
                &req,
                json!({ "entityId": entity_id, "flags": flags }),
                move |engine| engine.get_entity_by_entity_id(wire_id(entity_id, EntityId::new)?, flags),
            )
            .await?;
        Ok(Response::new(GetEntityByEntityIdResponse { result }))
    }

    async fn get_entity_by_record_id(
        &self,
        request: Request<GetEntityByRecordIdRequest>,
    ) -> std::result::Result<Response<GetEntityByRecordIdResponse>, Status> {
        let req = request.into_inner();
        let (code, id, flags) = (req.data_source_code.clone(), req.record_id.clone(), req.flags);
        let result = self
            .core
            .call(
                25,
                "GetEntityByRecordId",
                &req,
                json!({ "dataSourceCode": code, "recordId": id, "flags": flags }),
                move |engine| engine.get_entity_by_record_id(&code, &id, flags),
            )
            .await?;
        Ok(Response::new(GetEntityByRecordIdResponse { result }))
    }

    async fn get_record(
        &self,
        request: Request<GetRecordRequest>,
    ) -> std::result::Result<Response<GetRecordResponse>, Status> {
        let req = request.into_inner();
        let (code, id, flags) = (req.data_source_code.clone(), req.record_id.clone(), req.flags);
        let result = self
            .core
            .call(
                27,
                "GetRecord",
                &req,
                json!({ "dataSourceCode": code, "recordId": id, "flags": flags }),
                move |engine| engine.get_record(&code, &id, flags),
            )
            .await?;
        Ok(Response::new(GetRecordResponse { result }))
    }

    async fn get_redo_record(
        &self,
        request: Request<GetRedoRecordRequest>,
    ) -> std::result::Result<Response<GetRedoRecordResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .core
            .call(29, "GetRedoRecord", &req, json!({}), |engine| engine.get_redo_record())
            .await?;
        Ok(Response::new(GetRedoRecordResponse { result }))
    }

    async fn get_stats(
        &self,
        request: Request<GetStatsRequest>,
    ) -> std::result::Result<Response<GetStatsResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .core
            .call(31, "GetStats", &req, json!({}), |engine| engine.get_stats())
            .await?;
        Ok(Response::new(GetStatsResponse { result }))
    }

    async fn how_entity_by_entity_id(
        &self,
        request: Request<HowEntityByEntityIdRequest>,
    ) -> std::result::Result<Response<HowEntityByEntityIdResponse>, Status> {
        let req = request.into_inner();
        let (entity_id, flags) = (req.entity_id, req.flags);
        let result = self
            .core
            .call(
                33,
                "HowEntityByEntityId",
                &req,
                json!({ "entityId": entity_id, "flags": flags }),
                move |engine| engine.how_entity_by_entity_id(wire_id(entity_id, EntityId::new)?, flags),
            )
            .await?;
        Ok(Response::new(HowEntityByEntityIdResponse { result }))
    }

    async fn prime_engine(
        &self,
        request: Request<PrimeEngineRequest>,
    ) -> std::result::Result<Response<PrimeEngineResponse>, Status> {
        let req = request.into_inner();
        self.core
            .call(35, "PrimeEngine", &req, json!({}), |engine| engine.prime_engine())
            .await?;
        Ok(Response::new(PrimeEngineResponse {}))
    }

    async fn process_redo_record(
        &self,
        request: Request<ProcessRedoRecordRequest>,
    ) -> std::result::Result<Response<ProcessRedoRecordResponse>, Status> {
        let req = request.into_inner();
        let (redo, flags) = (req.redo_record.clone(), req.flags);
        let result = self
            .core
            .call(37, "ProcessRedoRecord", &req, json!({ "flags": flags }), move |engine| {
                engine.process_redo_record(&redo, flags)
            })
            .await?;
        Ok(Response::new(ProcessRedoRecordResponse { result }))
    }

    async fn reevaluate_entity(
        &self,
        request: Request<ReevaluateEntityRequest>,
    ) -> std::result::Result<Response<ReevaluateEntityResponse>, Status> {
        let req = request.into_inner();
        let (entity_id, flags) = (req.entity_id, req.flags);
        let result = self
            .core
            .call(
                39,
                "ReevaluateEntity",
                &req,
                json!({ "entityId": entity_id, "flags": flags }),
                move |engine| engine.reevaluate_entity(wire_id(entity_id, EntityId::new)?, flags),
            )
            .await?;
        Ok(Response::new(ReevaluateEntityResponse { result }))
    }

    async fn reevaluate_record(
        &self,
        request: Request<ReevaluateRecordRequest>,
    ) -> std::result::Result<Response<ReevaluateRecordResponse>, Status> {
        let req = request.into_inner();
        let (code, id, flags) = (req.data_source_code.clone(), req.record_id.clone(), req.flags);
        let result = self
            .core
            .call(
                41,
                "ReevaluateRecord",
                &req,
                json!({ "dataSourceCode": code, "recordId": id, "flags": flags }),
                move |engine| engine.reevaluate_record(&code, &id, flags),
            )
            .await?;
        Ok(Response::new(ReevaluateRecordResponse { result }))
    }

    async fn reinitialize(
        &self,
        request: Request<ReinitializeRequest>,
    ) -> std::result::Result<Response<ReinitializeResponse>, Status> {
        let req = request.into_inner();
        let config_id = req.config_id;
        self.core
            .call_lifecycle(43, "Reinitialize", &req, json!({ "configId": config_id }), move |engine| {
                engine.reinitialize(wire_id(config_id, ConfigId::new)?)
            })
            .await?;
        Ok(Response::new(ReinitializeResponse {}))
    }

    async fn replace_record(
        &self,
        request: Request<ReplaceRecordRequest>,
    ) -> std::result::Result<Response<ReplaceRecordResponse>, Status> {
        let req = request.into_inner();
        let (code, id, definition, flags) = (
            req.data_source_code.clone(),
            req.record_id.clone(),
            req.record_definition.clone(),
            req.flags,
        );
        let result = self
            .core
            .call(
                45,
                "ReplaceRecord",
                &req,
                json!({ "dataSourceCode": code, "recordId": id, "flags": flags }),
                move |engine| engine.replace_record(&code, &id, &definition, flags),
            )
            .await?;
        Ok(Response::new(ReplaceRecordResponse { result }))
    }

    async fn search_by_attributes(
        &self,
        request: Request<SearchByAttributesRequest>,
    ) -> std::result::Result<Response<SearchByAttributesResponse>, Status> {
        let req = request.into_inner();
        let (attributes, profile, flags) =
            (req.attributes.clone(), req.search_profile.clone(), req.flags);
        let result = self
            .core
            .call(
                47,
                "SearchByAttributes",
                &req,
                json!({ "searchProfile": profile, "flags": flags }),
                move |engine| engine.search_by_attributes(&attributes, &profile, flags),
            )
            .await?;
        Ok(Response::new(SearchByAttributesResponse { result }))
    }

    type StreamExportCsvEntityReportStream =
        ReceiverStream<std::result::Result<StreamExportCsvEntityReportResponse, Status>>;

    async fn stream_export_csv_entity_report(
        &self,
        request: Request<StreamExportCsvEntityReportRequest>,
    ) -> std::result::Result<Response<Self::StreamExportCsvEntityReportStream>, Status> {
        let req = request.into_inner();
        let (columns, flags) = (req.csv_column_list.clone(), req.flags);
        let handle = self
            .core
            .call(
                49,
                "StreamExportCsvEntityReport",
                &req,
                json!({ "csvColumnList": columns, "flags": flags }),
                move |engine| engine.export_csv_entity_report(&columns, flags),
            )
            .await?;
        Ok(Response::new(self.export_stream(handle, |result, done| {
            StreamExportCsvEntityReportResponse { result, done }
        })))
    }

    type StreamExportJsonEntityReportStream =
        ReceiverStream<std::result::Result<StreamExportJsonEntityReportResponse, Status>>;

    async fn stream_export_json_entity_report(
        &self,
        request: Request<StreamExportJsonEntityReportRequest>,
    ) -> std::result::Result<Response<Self::StreamExportJsonEntityReportStream>, Status> {
        let req = request.into_inner();
        let flags = req.flags;
        let handle = self
            .core
            .call(51, "StreamExportJsonEntityReport", &req, json!({ "flags": flags }), move |engine| {
                engine.export_json_entity_report(flags)
            })
            .await?;
        Ok(Response::new(self.export_stream(handle, |result, done| {
            StreamExportJsonEntityReportResponse { result, done }
        })))
    }

    async fn why_entities(
        &self,
        request: Request<WhyEntitiesRequest>,
    ) -> std::result::Result<Response<WhyEntitiesResponse>, Status> {
        let req = request.into_inner();
        let (first, second, flags) = (req.entity_id_1, req.entity_id_2, req.flags);
        let result = self
            .core
            .call(
                53,
                "WhyEntities",
                &req,
                json!({ "entityId1": first, "entityId2": second, "flags": flags }),
                move |engine| {
                    engine.why_entities(
                        wire_id(first, EntityId::new)?,
                        wire_id(second, EntityId::new)?,
                        flags,
                    )
                },
            )
            .await?;
        Ok(Response::new(WhyEntitiesResponse { result }))
    }

    async fn why_records(
        &self,
        request: Request<WhyRecordsRequest>,
    ) -> std::result::Result<Response<WhyRecordsResponse>, Status> {
        let req = request.into_inner();
        let (code_1, id_1, code_2, id_2, flags) = (
            req.data_source_code_1.clone(),
            req.record_id_1.clone(),
            req.data_source_code_2.clone(),
            req.record_id_2.clone(),
            req.flags,
        );
        let result = self
            .core
            .call(
                55,
                "WhyRecords",
                &req,
                json!({
                    "dataSourceCode1": code_1,
                    "recordId1": id_1,
                    "dataSourceCode2": code_2,
                    "recordId2": id_2,
                    "flags": flags,
                }),
                move |engine| engine.why_records(&code_1, &id_1, &code_2, &id_2, flags),
            )
            .await?;
        Ok(Response::new(WhyRecordsResponse { result }))
    }
}
