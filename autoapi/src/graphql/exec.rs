//! Compiles generated definitions into an executable `async-graphql` dynamic
//! schema.

use std::sync::Arc;

use async_graphql::dynamic::{
    Field, FieldFuture, FieldValue, InputObject, InputValue, Object, ResolverContext, Scalar, Schema, TypeRef,
};
use async_graphql::{ErrorExtensions, Value as GqlValue};
use serde_json::Value;

use super::builder::{
    ArgumentDefinition, FieldDefinition, GraphQlScalar, RootFieldDefinition, RootKind, TableTypes, TypeExpr,
};
use crate::conf::DatasourceId;
use crate::db::{JsonRow, Operation, QueryResult, Record, SortOrder};
use crate::errors::ApiError;
use crate::meta::TableDescriptor;
use crate::service::{DataService, unexpected};

pub const DEFAULT_PAGE_SIZE: u32 = 20;

fn gql_error(e: ApiError) -> async_graphql::Error {
    let code = e.code();
    async_graphql::Error::new(e.message().to_string()).extend_with(|_, ext| ext.set("code", code.to_string()))
}

fn type_ref(ty: &TypeExpr) -> TypeRef {
    match (ty.list, ty.non_null) {
        (true, true) => TypeRef::named_nn_list_nn(ty.name.clone()),
        (true, false) => TypeRef::named_nn_list(ty.name.clone()),
        (false, true) => TypeRef::named_nn(ty.name.clone()),
        (false, false) => TypeRef::named(ty.name.clone()),
    }
}

/// Shapes a JSON cell into the declared output scalar. Drivers report
/// booleans as 0/1 and decimals as numbers; both are normalised here.
fn output_value(scalar: GraphQlScalar, value: &Value) -> Option<GqlValue> {
    let coerced = match (scalar, value) {
        (_, Value::Null) => return None,
        (GraphQlScalar::Boolean, Value::Number(n)) => Value::Bool(n.as_i64().is_some_and(|i| i != 0)),
        (GraphQlScalar::Int | GraphQlScalar::Long, Value::String(s)) => match s.parse::<i64>() {
            Ok(i) => Value::from(i),
            Err(_) => value.clone(),
        },
        (GraphQlScalar::Float, Value::String(s)) => match s.parse::<f64>() {
            Ok(f) => Value::from(f),
            Err(_) => value.clone(),
        },
        (GraphQlScalar::String | GraphQlScalar::ID, Value::String(_)) => value.clone(),
        (GraphQlScalar::String | GraphQlScalar::ID, Value::Number(n)) => Value::String(n.to_string()),
        (GraphQlScalar::String | GraphQlScalar::ID, Value::Bool(b)) => Value::String(b.to_string()),
        (GraphQlScalar::String | GraphQlScalar::ID, other) => Value::String(other.to_string()),
        _ => value.clone(),
    };
    GqlValue::from_json(coerced).ok()
}

fn object_field(def: &FieldDefinition) -> Field {
    let column = def.column.clone();
    let field_name = def.name.clone();
    let scalar = def.scalar;
    let mut field = Field::new(def.name.clone(), type_ref(&def.ty), move |ctx| {
        let column = column.clone();
        let field_name = field_name.clone();
        FieldFuture::new(async move {
            let row = ctx.parent_value.try_downcast_ref::<JsonRow>()?;
            let cell = row.get(&column).or_else(|| row.get(&field_name));
            Ok(cell.and_then(|v| output_value(scalar, v)).map(FieldValue::value))
        })
    });
    if let Some(desc) = &def.description {
        field = field.description(desc.clone());
    }
    field
}

fn input_object(name: &str, fields: &[FieldDefinition]) -> InputObject {
    fields.iter().fold(InputObject::new(name), |obj, f| {
        obj.field(InputValue::new(f.name.clone(), type_ref(&f.ty)))
    })
}

fn with_arguments(field: Field, args: &[ArgumentDefinition]) -> Field {
    args.iter()
        .fold(field, |f, a| f.argument(InputValue::new(a.name.clone(), type_ref(&a.ty))))
}

fn arg_json(ctx: &ResolverContext<'_>, name: &str) -> Result<Option<Value>, ApiError> {
    match ctx.args.get(name) {
        None => Ok(None),
        Some(v) => {
            let json = v
                .as_value()
                .clone()
                .into_json()
                .map_err(|e| ApiError::Validation(format!("Bad argument '{}': {}", name, e)))?;
            Ok((!json.is_null()).then_some(json))
        }
    }
}

fn arg_u32(ctx: &ResolverContext<'_>, name: &str) -> Result<Option<u32>, ApiError> {
    match arg_json(ctx, name)? {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .and_then(|i| u32::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| ApiError::Validation(format!("'{}' must be a non-negative integer", name))),
    }
}

fn key_from_args(ctx: &ResolverContext<'_>, def: &RootFieldDefinition) -> Result<Value, ApiError> {
    let keys: Vec<&ArgumentDefinition> = def.arguments.iter().filter(|a| a.column.is_some()).collect();
    if let [single] = keys.as_slice() {
        return arg_json(ctx, &single.name)?
            .ok_or_else(|| ApiError::Validation(format!("Missing argument '{}'", single.name)));
    }
    let mut key = Record::new();
    for arg in keys {
        let value = arg_json(ctx, &arg.name)?
            .ok_or_else(|| ApiError::Validation(format!("Missing argument '{}'", arg.name)))?;
        key.insert(arg.name.clone(), value);
    }
    Ok(Value::Object(key))
}

fn input_record(ctx: &ResolverContext<'_>) -> Result<Record, ApiError> {
    match arg_json(ctx, "input")? {
        Some(Value::Object(map)) => Ok(map),
        _ => Err(ApiError::Validation("Argument 'input' must be an object".into())),
    }
}

fn list_operation(ctx: &ResolverContext<'_>) -> Result<Operation, ApiError> {
    let page = arg_u32(ctx, "page")?;
    let size = arg_u32(ctx, "size")?;
    let order_by = arg_json(ctx, "orderBy")?.and_then(|v| v.as_str().map(str::to_string));
    let order = match arg_json(ctx, "order")? {
        Some(Value::String(s)) => SortOrder::parse(&s)?,
        _ => SortOrder::Asc,
    };
    if page.is_none() && size.is_none() && order_by.is_none() {
        return Ok(Operation::List {
            filters: Record::new(),
            limit: None,
        });
    }
    Ok(Operation::PaginatedList {
        filters: Record::new(),
        page: page.unwrap_or(1),
        size: size.unwrap_or(DEFAULT_PAGE_SIZE),
        order_by,
        order,
    })
}

/// Resolver input, read out of the GraphQL arguments before any I/O.
enum Call {
    Read(Operation),
    Create(Record),
    Write(Operation),
}

fn parse_call(ctx: &ResolverContext<'_>, def: &RootFieldDefinition) -> Result<Call, ApiError> {
    Ok(match def.kind {
        RootKind::List => Call::Read(list_operation(ctx)?),
        RootKind::Get => Call::Read(Operation::GetById {
            key: key_from_args(ctx, def)?,
        }),
        RootKind::Create => Call::Create(input_record(ctx)?),
        RootKind::Update => Call::Write(Operation::Update {
            key: key_from_args(ctx, def)?,
            values: input_record(ctx)?,
        }),
        RootKind::Delete => Call::Write(Operation::Delete {
            key: key_from_args(ctx, def)?,
        }),
    })
}

async fn resolve<'a>(
    service: &DataService,
    ds: DatasourceId,
    table: &TableDescriptor,
    call: Call,
) -> Result<Option<FieldValue<'a>>, ApiError> {
    match call {
        Call::Read(op) => match service.run(ds, table, op).await? {
            QueryResult::Rows(rows) => Ok(Some(FieldValue::list(rows.into_iter().map(FieldValue::owned_any)))),
            QueryResult::Row(row) => Ok(row.map(FieldValue::owned_any)),
            other => Err(unexpected(other)),
        },
        Call::Create(values) => Ok(Some(FieldValue::owned_any(service.create(ds, table, values).await?))),
        Call::Write(op) => affected(service.run(ds, table, op).await?),
    }
}

fn affected<'a>(result: QueryResult) -> Result<Option<FieldValue<'a>>, ApiError> {
    match result {
        QueryResult::Affected(outcome) => Ok(Some(FieldValue::value(outcome.rows_affected > 0))),
        other => Err(unexpected(other)),
    }
}

fn root_field(service: &DataService, ds: DatasourceId, types: &Arc<TableTypes>, def: &RootFieldDefinition) -> Field {
    let service = service.clone();
    let types = types.clone();
    let def_owned = def.clone();
    let field = Field::new(def.name.clone(), type_ref(&def.returns), move |ctx| {
        let service = service.clone();
        let types = types.clone();
        let def = def_owned.clone();
        FieldFuture::new(async move {
            let call = parse_call(&ctx, &def).map_err(gql_error)?;
            resolve(&service, ds, &types.descriptor, call).await.map_err(gql_error)
        })
    });
    with_arguments(field, &def.arguments)
}

/// Builds the executable schema for one datasource.
pub fn compile(service: &DataService, ds: DatasourceId, tables: &[Arc<TableTypes>]) -> Result<Schema, ApiError> {
    let names: Vec<String> = tables.iter().map(|t| t.object.table_name.clone()).collect();
    let mut query = Object::new("Query").field(Field::new(
        "tables",
        TypeRef::named_nn_list_nn(TypeRef::STRING),
        move |_| {
            let names = names.clone();
            FieldFuture::new(async move { Ok(Some(FieldValue::list(names.into_iter().map(FieldValue::value)))) })
        },
    ));
    let mut mutation = Object::new("Mutation");

    let mut builder_types: Vec<async_graphql::dynamic::Type> = vec![Scalar::new("Long").into()];
    for t in tables {
        let object = t
            .object
            .fields
            .iter()
            .fold(Object::new(t.object.name.clone()), |obj, f| obj.field(object_field(f)));
        let object = match &t.object.description {
            Some(desc) => object.description(desc.clone()),
            None => object,
        };
        builder_types.push(object.into());
        builder_types.push(input_object(&t.create_input.name, &t.create_input.fields).into());
        if let Some(update) = &t.update_input {
            builder_types.push(input_object(&update.name, &update.fields).into());
        }
        for q in &t.queries {
            query = query.field(root_field(service, ds, t, q));
        }
        for m in &t.mutations {
            mutation = mutation.field(root_field(service, ds, t, m));
        }
    }

    let has_mutations = !tables.is_empty();
    let mut schema = Schema::build("Query", has_mutations.then_some("Mutation"), None).register(query);
    if has_mutations {
        schema = schema.register(mutation);
    }
    for ty in builder_types {
        schema = schema.register(ty);
    }
    schema
        .finish()
        .map_err(|e| ApiError::Generation(format!("GraphQL schema for datasource {} is invalid: {}", ds, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn output_coercion() {
        assert_eq!(output_value(GraphQlScalar::Boolean, &json!(1)), Some(GqlValue::Boolean(true)));
        assert_eq!(output_value(GraphQlScalar::String, &json!(12.5)), Some(GqlValue::String("12.5".into())));
        assert_eq!(output_value(GraphQlScalar::Long, &json!("42")), Some(GqlValue::from(42)));
        assert_eq!(output_value(GraphQlScalar::Int, &Value::Null), None);
    }

    #[test]
    fn type_refs_render() {
        assert_eq!(type_ref(&TypeExpr::list_nn("User")).to_string(), "[User!]!");
        assert_eq!(type_ref(&TypeExpr::named("Int")).to_string(), "Int");
    }
}
