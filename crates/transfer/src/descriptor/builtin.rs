use cmdb_store::document::{get_i64, get_str};
use cmdb_store::Document;
use cmdb_transfer_primitives::common::{
    quoted_src_model, BK_APP_ID_FIELD, BK_ASST_INST_ID_FIELD, BK_ASST_OBJ_ID_FIELD, BK_FIELD_ID,
    BK_HOST_ID_FIELD, BK_INST_ASST_TABLE_PREFIX, BK_INST_ID_FIELD,
    BK_MODULE_ID_FIELD, BK_OBJECT_INST_TABLE_PREFIX, BK_OBJ_ID_FIELD, BK_PROCESS_ID_FIELD,
    BK_QUOTED_INST_TABLE_PREFIX, BK_SERVICE_INSTANCE_ID_FIELD, BK_SET_ID_FIELD,
    BK_TABLE_NAME_BASE_APP, BK_TABLE_NAME_BASE_HOST, BK_TABLE_NAME_BASE_MODULE,
    BK_TABLE_NAME_BASE_PROCESS, BK_TABLE_NAME_BASE_SET, BK_TABLE_NAME_MODULE_HOST_CONFIG,
    BK_TABLE_NAME_PROCESS_INSTANCE_RELATION, BK_TABLE_NAME_SERVICE_INSTANCE,
};
use cmdb_transfer_primitives::ResType;
use serde::{Deserialize, Serialize};

use super::{Collection, InnerIdRemap, RelatedIds, ResourceDescriptor};
use crate::error::ParseError;

/// Every built-in resource type.
#[must_use]
pub fn builtin_descriptors() -> Vec<Box<dyn ResourceDescriptor>> {
    vec![
        Box::new(SimpleDescriptor::new(
            ResType::Biz,
            BK_APP_ID_FIELD,
            BK_TABLE_NAME_BASE_APP,
            &[],
        )),
        Box::new(SimpleDescriptor::new(
            ResType::Set,
            BK_SET_ID_FIELD,
            BK_TABLE_NAME_BASE_SET,
            &[(ResType::Biz, BK_APP_ID_FIELD)],
        )),
        Box::new(SimpleDescriptor::new(
            ResType::Module,
            BK_MODULE_ID_FIELD,
            BK_TABLE_NAME_BASE_MODULE,
            &[(ResType::Biz, BK_APP_ID_FIELD), (ResType::Set, BK_SET_ID_FIELD)],
        )),
        Box::new(SimpleDescriptor::new(
            ResType::Host,
            BK_HOST_ID_FIELD,
            BK_TABLE_NAME_BASE_HOST,
            &[],
        )),
        Box::new(HostRelationDescriptor),
        Box::new(ObjectInstanceDescriptor),
        Box::new(InstAsstDescriptor),
        Box::new(QuotedInstanceDescriptor),
        Box::new(SimpleDescriptor::new(
            ResType::ServiceInstance,
            BK_FIELD_ID,
            BK_TABLE_NAME_SERVICE_INSTANCE,
            &[(ResType::Biz, BK_APP_ID_FIELD)],
        )),
        Box::new(SimpleDescriptor::new(
            ResType::Process,
            BK_PROCESS_ID_FIELD,
            BK_TABLE_NAME_BASE_PROCESS,
            &[(ResType::Biz, BK_APP_ID_FIELD)],
        )),
        Box::new(SimpleDescriptor::new(
            ResType::ProcessRelation,
            BK_PROCESS_ID_FIELD,
            BK_TABLE_NAME_PROCESS_INSTANCE_RELATION,
            &[
                (ResType::Biz, BK_APP_ID_FIELD),
                (ResType::ServiceInstance, BK_SERVICE_INSTANCE_ID_FIELD),
            ],
        )),
    ]
}

/// A resource type stored as free-form rows in one table per tenant.
#[derive(Clone, Copy, Debug)]
pub struct SimpleDescriptor {
    res_type: ResType,
    id_field: &'static str,
    table: &'static str,
    related: &'static [(ResType, &'static str)],
}

impl SimpleDescriptor {
    /// `related` lists the fields naming other resources, read when present.
    #[must_use]
    pub const fn new(
        res_type: ResType,
        id_field: &'static str,
        table: &'static str,
        related: &'static [(ResType, &'static str)],
    ) -> Self {
        Self {
            res_type,
            id_field,
            table,
            related,
        }
    }
}

impl ResourceDescriptor for SimpleDescriptor {
    fn res_type(&self) -> ResType {
        self.res_type
    }

    fn id_field(&self) -> &'static str {
        self.id_field
    }

    fn collection(&self) -> Collection {
        Collection::Fixed(self.table)
    }

    fn related_ids(&self, _sub_res: &str, doc: &Document) -> Result<RelatedIds, ParseError> {
        let mut ids = RelatedIds::new();

        for (res_type, field) in self.related {
            if let Some(id) = get_i64(doc, field) {
                ids.entry(*res_type).or_default().push(id);
            }
        }

        Ok(ids)
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct ModuleHost {
    bk_biz_id: i64,
    bk_set_id: i64,
    bk_module_id: i64,
    bk_host_id: i64,
    #[serde(flatten)]
    rest: Document,
}

/// Host to module assignments. Host pool assignments are translated between environments.
#[derive(Clone, Copy, Debug)]
pub struct HostRelationDescriptor;

impl ResourceDescriptor for HostRelationDescriptor {
    fn res_type(&self) -> ResType {
        ResType::HostRelation
    }

    fn id_field(&self) -> &'static str {
        BK_FIELD_ID
    }

    fn collection(&self) -> Collection {
        Collection::Fixed(BK_TABLE_NAME_MODULE_HOST_CONFIG)
    }

    fn normalize(
        &self,
        doc: Document,
        remap: Option<&InnerIdRemap>,
    ) -> Result<Document, ParseError> {
        let mut relation: ModuleHost = serde_json::from_value(doc.into())?;

        if let Some(remap) = remap {
            relation.bk_biz_id = remap.biz(relation.bk_biz_id);
            relation.bk_set_id = remap.set(relation.bk_set_id);
            relation.bk_module_id = remap.module(relation.bk_module_id);
        }

        into_document(&relation)
    }

    fn related_ids(&self, _sub_res: &str, doc: &Document) -> Result<RelatedIds, ParseError> {
        let biz = get_i64(doc, BK_APP_ID_FIELD)
            .ok_or_else(|| ParseError::InvalidId(BK_APP_ID_FIELD.to_owned()))?;
        let host = get_i64(doc, BK_HOST_ID_FIELD)
            .ok_or_else(|| ParseError::InvalidId(BK_HOST_ID_FIELD.to_owned()))?;

        Ok(RelatedIds::from([
            (ResType::Biz, vec![biz]),
            (ResType::Host, vec![host]),
        ]))
    }
}

/// Instances of user defined objects, one table per object.
#[derive(Clone, Copy, Debug)]
pub struct ObjectInstanceDescriptor;

impl ResourceDescriptor for ObjectInstanceDescriptor {
    fn res_type(&self) -> ResType {
        ResType::ObjectInstance
    }

    fn id_field(&self) -> &'static str {
        BK_INST_ID_FIELD
    }

    fn collection(&self) -> Collection {
        Collection::PerObject(BK_OBJECT_INST_TABLE_PREFIX)
    }

    fn related_ids(&self, _sub_res: &str, doc: &Document) -> Result<RelatedIds, ParseError> {
        if !doc.contains_key(BK_APP_ID_FIELD) {
            return Ok(RelatedIds::new());
        }

        let biz = get_i64(doc, BK_APP_ID_FIELD)
            .ok_or_else(|| ParseError::InvalidId(BK_APP_ID_FIELD.to_owned()))?;

        Ok(RelatedIds::from([(ResType::Biz, vec![biz])]))
    }

    fn event_sub_resources(&self, doc: &Document) -> Option<Vec<String>> {
        get_str(doc, BK_OBJ_ID_FIELD).map(|obj_id| vec![obj_id.to_owned()])
    }

    fn indexes_location(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct InstAsst {
    id: i64,
    bk_obj_id: String,
    bk_inst_id: i64,
    bk_asst_obj_id: String,
    bk_asst_inst_id: i64,
    #[serde(flatten)]
    rest: Document,
}

/// Associations between two instances, stored with each of the two objects.
#[derive(Clone, Copy, Debug)]
pub struct InstAsstDescriptor;

impl ResourceDescriptor for InstAsstDescriptor {
    fn res_type(&self) -> ResType {
        ResType::InstAsst
    }

    fn id_field(&self) -> &'static str {
        BK_FIELD_ID
    }

    fn collection(&self) -> Collection {
        Collection::PerObject(BK_INST_ASST_TABLE_PREFIX)
    }

    fn normalize(
        &self,
        doc: Document,
        _remap: Option<&InnerIdRemap>,
    ) -> Result<Document, ParseError> {
        let asst: InstAsst = serde_json::from_value(doc.into())?;

        into_document(&asst)
    }

    fn related_ids(&self, _sub_res: &str, doc: &Document) -> Result<RelatedIds, ParseError> {
        let mut ids = RelatedIds::new();

        for (obj_field, inst_field) in [
            (BK_OBJ_ID_FIELD, BK_INST_ID_FIELD),
            (BK_ASST_OBJ_ID_FIELD, BK_ASST_INST_ID_FIELD),
        ] {
            let obj_id = get_str(doc, obj_field)
                .ok_or_else(|| ParseError::InvalidField(obj_field.to_owned()))?;
            let inst_id =
                get_i64(doc, inst_field).ok_or_else(|| ParseError::InvalidId(inst_field.to_owned()))?;

            ids.entry(ResType::of_object(obj_id)).or_default().push(inst_id);
        }

        Ok(ids)
    }

    fn event_sub_resources(&self, doc: &Document) -> Option<Vec<String>> {
        let obj_id = get_str(doc, BK_OBJ_ID_FIELD)?;
        let asst_obj_id = get_str(doc, BK_ASST_OBJ_ID_FIELD)?;

        if obj_id == asst_obj_id {
            return Some(vec![obj_id.to_owned()]);
        }

        Some(vec![obj_id.to_owned(), asst_obj_id.to_owned()])
    }
}

/// Rows of table-typed properties, the sub-resource is the quoted model id.
#[derive(Clone, Copy, Debug)]
pub struct QuotedInstanceDescriptor;

impl ResourceDescriptor for QuotedInstanceDescriptor {
    fn res_type(&self) -> ResType {
        ResType::QuotedInstance
    }

    fn id_field(&self) -> &'static str {
        BK_FIELD_ID
    }

    fn collection(&self) -> Collection {
        Collection::PerObject(BK_QUOTED_INST_TABLE_PREFIX)
    }

    fn related_ids(&self, sub_res: &str, doc: &Document) -> Result<RelatedIds, ParseError> {
        let Some(src_model) = quoted_src_model(sub_res) else {
            return Ok(RelatedIds::new());
        };

        let inst_id = get_i64(doc, BK_INST_ID_FIELD)
            .ok_or_else(|| ParseError::InvalidId(BK_INST_ID_FIELD.to_owned()))?;

        Ok(RelatedIds::from([(ResType::of_object(src_model), vec![inst_id])]))
    }
}

fn into_document<T: Serialize>(value: &T) -> Result<Document, ParseError> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(doc) => Ok(doc),
        other => Err(ParseError::InvalidField(format!("expected an object, got {other}"))),
    }
}
