use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::TimetablerAuthSource;
use crate::engine::{BulkResult, Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, ResultShape};
use crate::tenant::TenantManager;

pub struct TimetablerHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<TimetablerQueryParser>,
}

impl TimetablerHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(TimetablerQueryParser),
        }
    }

    /// The tenant is the database name the client connected with.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Run every statement of a simple query in order. The first failure
    /// ends the batch; statements before it stay applied.
    async fn run_batch<C: ClientInfo>(
        &self,
        client: &C,
        query: &str,
    ) -> PgWireResult<Vec<Response>> {
        let engine = self.resolve_engine(client)?;
        let cmds = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            responses.extend(self.run(&engine, cmd).await?);
        }
        Ok(responses)
    }

    /// Run and time one statement.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(engine, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertDay { id, name, number } => {
                engine.register_day(id, name, number).await.map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::SetDayActive {
                institution_id,
                day_id,
                active,
            } => {
                engine
                    .set_day_active(institution_id, day_id, active)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertShift {
                id,
                institution_id,
                kind,
                program_type,
            } => {
                engine
                    .create_shift(id, institution_id, kind, program_type)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertReference { reference } => {
                engine
                    .register_reference(reference)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertTimeTable {
                id,
                shift_id,
                title,
                description,
                start_date,
                end_date,
            } => {
                engine
                    .create_time_table(id, shift_id, title, description, start_date, end_date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertSlot { shift_id, input } => {
                let slot = engine.create_slot(shift_id, input).await.map_err(engine_err)?;
                Ok(vec![slot_rows(vec![slot])])
            }
            Command::UpdateSlot { id, patch } => {
                let current = engine
                    .get_slot(id)
                    .await
                    .ok_or_else(|| engine_err(EngineError::NotFound(Entity::Slot, id)))?;
                let slot = engine
                    .update_slot(id, patch.apply(&current))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![slot_rows(vec![slot])])
            }
            Command::DeleteSlot { id } => {
                let removed = engine.delete_slot(id).await.map_err(engine_err)?;
                debug!("slot {id} deleted with {} allocations", removed.len());
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertAllocation { input } => {
                let allocation = engine
                    .create_allocation(input)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![allocation_rows(vec![allocation])])
            }
            Command::BulkApply {
                time_table_id,
                slot_id,
                section_id,
                days,
                payload,
                existing,
            } => {
                let result = engine
                    .bulk_apply(time_table_id, slot_id, section_id, &days, payload, &existing)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![bulk_apply_rows(result)])
            }
            Command::UpdateAllocation { id, patch } => {
                let current = engine
                    .get_allocation(id)
                    .await
                    .ok_or_else(|| engine_err(EngineError::NotFound(Entity::Allocation, id)))?;
                let allocation = engine
                    .update_allocation(id, patch.apply(&current))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![allocation_rows(vec![allocation])])
            }
            Command::DeleteAllocation { id } => {
                engine.delete_allocation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::BulkRemove { ids } => {
                let result = engine.bulk_remove(&ids).await.map_err(engine_err)?;
                Ok(vec![bulk_remove_rows(result)])
            }
            Command::SelectAllocations { time_table_id } => {
                let rows = engine.list_allocations(time_table_id).await;
                Ok(vec![allocation_rows(rows)])
            }
            Command::SelectSlots { shift_id } => {
                let slots = engine.list_slots(shift_id).await.map_err(engine_err)?;
                Ok(vec![slot_rows(slots)])
            }
            Command::SelectConflicts {
                time_table_id,
                candidate,
                exclude,
            } => {
                let conflicts = engine
                    .find_conflicts(time_table_id, &candidate, exclude)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![conflict_rows(conflicts)])
            }
            Command::SelectWorkload { teacher_id, date } => {
                let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
                let entries = engine.teacher_workload(teacher_id, date).await;
                Ok(vec![workload_rows(entries)])
            }
        }
    }
}

fn insert_tag(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

// ── Result schemas and rows ──────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn allocations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("time_table_id", Type::INT8),
        field("section_id", Type::INT8),
        field("day_id", Type::INT8),
        field("slot_id", Type::INT8),
        field("teacher_id", Type::INT8),
        field("room_id", Type::INT8),
        field("course_id", Type::INT8),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("shift_id", Type::INT8),
        field("code", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("is_practical", Type::BOOL),
    ]
}

fn bulk_apply_schema() -> Vec<FieldInfo> {
    vec![
        field("day_id", Type::INT8),
        field("ok", Type::BOOL),
        field("allocation_id", Type::INT8),
        field("error", Type::VARCHAR),
    ]
}

fn bulk_remove_schema() -> Vec<FieldInfo> {
    vec![
        field("allocation_id", Type::INT8),
        field("ok", Type::BOOL),
        field("error", Type::VARCHAR),
    ]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![
        field("dimension", Type::VARCHAR),
        field("allocation_id", Type::INT8),
    ]
}

fn workload_schema() -> Vec<FieldInfo> {
    vec![
        field("time_table_id", Type::INT8),
        field("total", Type::INT8),
        field("allocation_id", Type::INT8),
        field("day_id", Type::INT8),
        field("slot_id", Type::INT8),
        field("section_id", Type::INT8),
        field("room_id", Type::INT8),
        field("course_id", Type::INT8),
    ]
}

fn schema_for(shape: ResultShape) -> Vec<FieldInfo> {
    match shape {
        ResultShape::None => vec![],
        ResultShape::Allocations => allocations_schema(),
        ResultShape::Slots => slots_schema(),
        ResultShape::BulkApply => bulk_apply_schema(),
        ResultShape::BulkRemove => bulk_remove_schema(),
        ResultShape::Conflicts => conflicts_schema(),
        ResultShape::Workload => workload_schema(),
    }
}

/// Ids travel as INT8.
fn int(id: Id) -> i64 {
    id as i64
}

fn opt_int(id: Option<Id>) -> Option<i64> {
    id.map(int)
}

fn error_json(e: &EngineError) -> String {
    serde_json::to_string(&e.payload()).unwrap_or_else(|_| e.to_string())
}

/// Encode every item with `encode` into a single query response.
fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<DataRow>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn allocation_rows(allocations: Vec<Allocation>) -> Response {
    query_response(allocations_schema(), allocations, |enc, a| {
        enc.encode_field(&int(a.id))?;
        enc.encode_field(&int(a.time_table_id))?;
        enc.encode_field(&opt_int(a.section_id))?;
        enc.encode_field(&int(a.day_id))?;
        enc.encode_field(&int(a.slot_id))?;
        enc.encode_field(&opt_int(a.teacher_id))?;
        enc.encode_field(&opt_int(a.room_id))?;
        enc.encode_field(&opt_int(a.course_id))
    })
}

fn slot_rows(slots: Vec<Slot>) -> Response {
    query_response(slots_schema(), slots, |enc, s| {
        enc.encode_field(&int(s.id))?;
        enc.encode_field(&int(s.shift_id))?;
        enc.encode_field(&s.code)?;
        enc.encode_field(&s.name)?;
        enc.encode_field(&s.start_time.format("%H:%M:%S").to_string())?;
        enc.encode_field(&s.end_time.format("%H:%M:%S").to_string())?;
        enc.encode_field(&s.is_practical)
    })
}

fn bulk_apply_rows(result: BulkResult<Allocation>) -> Response {
    query_response(bulk_apply_schema(), result.items, |enc, (day_id, outcome)| {
        enc.encode_field(&int(day_id))?;
        enc.encode_field(&outcome.is_ok())?;
        match outcome {
            Ok(a) => {
                enc.encode_field(&Some(int(a.id)))?;
                enc.encode_field(&None::<String>)
            }
            Err(e) => {
                enc.encode_field(&None::<i64>)?;
                enc.encode_field(&Some(error_json(&e)))
            }
        }
    })
}

fn bulk_remove_rows(result: BulkResult<Allocation>) -> Response {
    query_response(bulk_remove_schema(), result.items, |enc, (id, outcome)| {
        enc.encode_field(&int(id))?;
        enc.encode_field(&outcome.is_ok())?;
        enc.encode_field(&outcome.err().map(|e| error_json(&e)))
    })
}

fn conflict_rows(conflicts: Vec<Conflict>) -> Response {
    query_response(conflicts_schema(), conflicts, |enc, c| {
        enc.encode_field(&c.dimension.as_str().to_string())?;
        enc.encode_field(&int(c.allocation_id))
    })
}

fn workload_rows(entries: Vec<WorkloadEntry>) -> Response {
    let rows: Vec<(Id, usize, Allocation)> = entries
        .into_iter()
        .flat_map(|entry| {
            let total = entry.count();
            let tt = entry.time_table_id;
            entry.allocations.into_iter().map(move |a| (tt, total, a))
        })
        .collect();
    query_response(workload_schema(), rows, |enc, (tt, total, a)| {
        enc.encode_field(&int(tt))?;
        enc.encode_field(&(total as i64))?;
        enc.encode_field(&int(a.id))?;
        enc.encode_field(&int(a.day_id))?;
        enc.encode_field(&int(a.slot_id))?;
        enc.encode_field(&opt_int(a.section_id))?;
        enc.encode_field(&opt_int(a.room_id))?;
        enc.encode_field(&opt_int(a.course_id))
    })
}

#[async_trait]
impl SimpleQueryHandler for TimetablerHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run_batch(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TimetablerQueryParser;

#[async_trait]
impl QueryParser for TimetablerQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(sql::result_shape(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TimetablerHandler {
    type Statement = String;
    type QueryParser = TimetablerQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(&substitute_params(portal)).map_err(sql_err)?;
        let mut responses = self.run(&engine, cmd).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        let fields = schema_for(sql::result_shape(&target.statement));
        Ok(DescribeStatementResponse::new(param_types, fields))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let fields = schema_for(sql::result_shape(&target.statement.statement));
        Ok(DescribePortalResponse::new(fields))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Replace `$1`, `$2`, ... with the bound text-format values, highest first
/// so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TimetablerFactory {
    handler: Arc<TimetablerHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<TimetablerAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl TimetablerFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(TimetablerHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                TimetablerAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TimetablerFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(TimetablerFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23505",
        EngineError::Overlap(_) => "23P01",
        EngineError::Validation(_) | EngineError::EmptyBatch => "22023",
        EngineError::NotFound(..) => "02000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

/// Engine errors travel as their JSON payload under a per-kind SQLSTATE.
fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        error_json(&e),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    let code = match &e {
        sql::SqlError::LimitExceeded(_) => "54000",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_count() {
        assert_eq!(count_params("SELECT * FROM slots WHERE shift_id = 1"), 0);
        assert_eq!(
            count_params("INSERT INTO allocations (time_table_id, day_id, slot_id) VALUES ($1, $3, $2)"),
            3
        );
        assert_eq!(count_params("SELECT $10, $2"), 10);
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn sqlstate_per_kind() {
        let conflict = EngineError::Conflict(vec![Conflict {
            dimension: Dimension::Room,
            allocation_id: 7,
        }]);
        assert_eq!(sqlstate(&conflict), "23505");
        assert_eq!(sqlstate(&EngineError::Overlap(vec![1])), "23P01");
        assert_eq!(sqlstate(&EngineError::EmptyBatch), "22023");
        assert_eq!(sqlstate(&EngineError::NotFound(Entity::Slot, 1)), "02000");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("x")), "54000");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "58030");

        let json: serde_json::Value = serde_json::from_str(&error_json(&conflict)).unwrap();
        assert_eq!(json["kind"], "conflict");
        assert_eq!(json["dimensions"], serde_json::json!(["room"]));
        assert_eq!(json["conflictingIds"], serde_json::json!([7]));
    }

    #[test]
    fn every_shape_has_a_schema() {
        assert!(schema_for(ResultShape::None).is_empty());
        assert_eq!(schema_for(ResultShape::Allocations).len(), 8);
        assert_eq!(schema_for(ResultShape::Slots).len(), 7);
        assert_eq!(schema_for(ResultShape::BulkApply).len(), 4);
        assert_eq!(schema_for(ResultShape::BulkRemove).len(), 3);
        assert_eq!(schema_for(ResultShape::Conflicts).len(), 2);
        assert_eq!(schema_for(ResultShape::Workload).len(), 8);
    }
}
