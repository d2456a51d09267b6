//! Field names, table names and flags of the CMDB storage schema.

// fields
pub const MONGO_META_ID: &str = "_id";
pub const BK_FIELD_ID: &str = "id";
pub const BK_APP_ID_FIELD: &str = "bk_biz_id";
pub const BK_APP_NAME_FIELD: &str = "bk_biz_name";
pub const BK_SET_ID_FIELD: &str = "bk_set_id";
pub const BK_MODULE_ID_FIELD: &str = "bk_module_id";
pub const BK_HOST_ID_FIELD: &str = "bk_host_id";
pub const BK_INST_ID_FIELD: &str = "bk_inst_id";
pub const BK_OBJ_ID_FIELD: &str = "bk_obj_id";
pub const BK_ASST_OBJ_ID_FIELD: &str = "bk_asst_obj_id";
pub const BK_ASST_INST_ID_FIELD: &str = "bk_asst_inst_id";
pub const BK_OBJ_ASST_ID_FIELD: &str = "bk_obj_asst_id";
pub const BK_PROCESS_ID_FIELD: &str = "bk_process_id";
pub const BK_SERVICE_INSTANCE_ID_FIELD: &str = "service_instance_id";
pub const BK_DEFAULT_FIELD: &str = "default";
pub const BK_IS_PRE_FIELD: &str = "ispre";
pub const BK_OBJ_UUID_FIELD: &str = "obj_uuid";
pub const BK_DEST_MODEL_FIELD: &str = "dest_model";
pub const BK_SRC_MODEL_FIELD: &str = "src_model";
pub const TENANT_ID_FIELD: &str = "tenant_id";
pub const BK_TOKEN_FIELD: &str = "token";
pub const BK_START_AT_FIELD: &str = "start_at";

// tables
pub const BK_TABLE_NAME_BASE_APP: &str = "cc_ApplicationBase";
pub const BK_TABLE_NAME_BASE_SET: &str = "cc_SetBase";
pub const BK_TABLE_NAME_BASE_MODULE: &str = "cc_ModuleBase";
pub const BK_TABLE_NAME_BASE_HOST: &str = "cc_HostBase";
pub const BK_TABLE_NAME_MODULE_HOST_CONFIG: &str = "cc_ModuleHostConfig";
pub const BK_TABLE_NAME_OBJ_DES: &str = "cc_ObjDes";
pub const BK_TABLE_NAME_MODEL_QUOTE_RELATION: &str = "cc_ModelQuoteRelation";
pub const BK_TABLE_NAME_SERVICE_INSTANCE: &str = "cc_ServiceInstance";
pub const BK_TABLE_NAME_BASE_PROCESS: &str = "cc_Process";
pub const BK_TABLE_NAME_PROCESS_INSTANCE_RELATION: &str = "cc_ProcessInstanceRelation";
pub const BK_TABLE_NAME_OBJECT_BASE_MAPPING: &str = "cc_ObjectBaseMapping";
pub const BK_TABLE_NAME_SYNC_WATCH_TOKEN: &str = "cc_SyncWatchToken";

pub const BK_OBJECT_INST_TABLE_PREFIX: &str = "cc_ObjectBase_";
pub const BK_INST_ASST_TABLE_PREFIX: &str = "cc_InstAsst_";
pub const BK_QUOTED_INST_TABLE_PREFIX: &str = "cc_QuotedInst_";

// built-in objects
pub const BK_INNER_OBJ_ID_BIZ: &str = "biz";
pub const BK_INNER_OBJ_ID_SET: &str = "set";
pub const BK_INNER_OBJ_ID_MODULE: &str = "module";
pub const BK_INNER_OBJ_ID_HOST: &str = "host";

// flags
pub const DEFAULT_APP_FLAG: i64 = 1;
pub const DEFAULT_RES_SET_FLAG: i64 = 1;
pub const DEFAULT_RES_MODULE_FLAG: i64 = 1;

/// Name of the platform's own business, never replicated between environments.
pub const BK_APP_NAME: &str = "蓝鲸";

/// Separator between source model and property in a quoted model id.
pub const MODEL_QUOTE_SEPARATOR: char = '#';

/// Maximum number of rows fetched by one list query.
pub const BK_MAX_LIMIT_SIZE: usize = 500;

#[must_use]
pub fn object_inst_table(obj_uuid: &str) -> String {
    format!("{BK_OBJECT_INST_TABLE_PREFIX}{obj_uuid}")
}

#[must_use]
pub fn inst_asst_table(obj_uuid: &str) -> String {
    format!("{BK_INST_ASST_TABLE_PREFIX}{obj_uuid}")
}

#[must_use]
pub fn quoted_inst_table(obj_uuid: &str) -> String {
    format!("{BK_QUOTED_INST_TABLE_PREFIX}{obj_uuid}")
}

/// Returns the source model of a quoted model id of the form `<src_model>#<property>`.
#[must_use]
pub fn quoted_src_model(dest_model: &str) -> Option<&str> {
    let (src_model, property) = dest_model.split_once(MODEL_QUOTE_SEPARATOR)?;

    (!src_model.is_empty() && !property.is_empty()).then_some(src_model)
}
