use std::io;

use serde_json::{Value, json};

use crate::{
    clock::{ClockId, ClockPosition, QuerySince},
    errors::QueryParseError,
    fileinfo::systime_parts,
    query::{expr::compute_wholename, file_result::FileResult},
};

/// Context shared by every field renderer while rendering one query's
/// results.
pub struct RenderCtx<'a> {
    pub clock_id: &'a ClockId,
    pub clock_at_start: ClockPosition,
    pub since: QuerySince,
    pub name_start: usize,
}

type RenderFn = fn(&mut dyn FileResult, &RenderCtx<'_>) -> Option<Value>;

pub struct FieldRenderer {
    pub name: &'static str,
    render: RenderFn,
}

pub type FieldList = Vec<&'static FieldRenderer>;

impl FieldRenderer {
    pub fn render(&self, file: &mut dyn FileResult, ctx: &RenderCtx<'_>) -> Option<Value> {
        (self.render)(file, ctx)
    }
}

fn make_name(file: &mut dyn FileResult, ctx: &RenderCtx<'_>) -> Option<Value> {
    Some(Value::String(compute_wholename(ctx.name_start, file)))
}

fn make_symlink_target(file: &mut dyn FileResult, _ctx: &RenderCtx<'_>) -> Option<Value> {
    let target = file.read_link()?;
    Some(match target {
        Some(target) => Value::String(target),
        None => Value::Null,
    })
}

fn make_exists(file: &mut dyn FileResult, _ctx: &RenderCtx<'_>) -> Option<Value> {
    file.exists().map(Value::from)
}

fn make_size(file: &mut dyn FileResult, _ctx: &RenderCtx<'_>) -> Option<Value> {
    file.size().map(Value::from)
}

fn make_new(file: &mut dyn FileResult, ctx: &RenderCtx<'_>) -> Option<Value> {
    let is_new = match ctx.since {
        QuerySince::Clock {
            fresh_instance: true,
            ..
        } => true,
        QuerySince::Timestamp(since_ts) => {
            let ctime = file.ctime()?;
            ctime.timestamp > since_ts
        }
        QuerySince::Clock { ticks, .. } => {
            let ctime = file.ctime()?;
            ctime.ticks > ticks
        }
    };
    Some(Value::from(is_new))
}

fn make_cclock(file: &mut dyn FileResult, ctx: &RenderCtx<'_>) -> Option<Value> {
    let ctime = file.ctime()?;
    Some(Value::String(ctx.clock_id.format(ClockPosition {
        root_number: ctx.clock_at_start.root_number,
        ticks: ctime.ticks,
    })))
}

fn make_oclock(file: &mut dyn FileResult, ctx: &RenderCtx<'_>) -> Option<Value> {
    let otime = file.otime()?;
    Some(Value::String(ctx.clock_id.format(ClockPosition {
        root_number: ctx.clock_at_start.root_number,
        ticks: otime.ticks,
    })))
}

/// Sha1 rendering: hex digest for regular files, null for deleted files and
/// directories, `{"error": ...}` for IO failures. Errors never abort the
/// query.
fn make_content_sha1hex(file: &mut dyn FileResult, _ctx: &RenderCtx<'_>) -> Option<Value> {
    match file.exists() {
        Some(false) => return Some(Value::Null),
        Some(true) => {}
        None => return None,
    }
    if file.stat().is_some_and(|st| st.is_dir()) {
        return Some(Value::Null);
    }
    let sha1 = file.content_sha1()?;
    Some(match sha1 {
        Ok(digest) => {
            let mut hex = String::with_capacity(40);
            for byte in digest {
                hex.push_str(&format!("{byte:02x}"));
            }
            Value::String(hex)
        }
        Err(err)
            if matches!(
                err.kind,
                io::ErrorKind::NotFound | io::ErrorKind::IsADirectory
            ) =>
        {
            Value::Null
        }
        Err(err) => json!({"error": err.message}),
    })
}

fn make_type(file: &mut dyn FileResult, _ctx: &RenderCtx<'_>) -> Option<Value> {
    let dtype = file.dtype()?;
    if dtype != crate::fileinfo::DType::Unknown {
        return Some(Value::String(dtype.code().to_string()));
    }
    let stat = file.stat()?;
    Some(Value::String(stat.dtype().code().to_string()))
}

macro_rules! stat_int_field {
    ($fn_name:ident, $member:ident) => {
        fn $fn_name(file: &mut dyn FileResult, _ctx: &RenderCtx<'_>) -> Option<Value> {
            file.stat().map(|st| Value::from(st.$member))
        }
    };
}

stat_int_field!(make_mode, mode);
stat_int_field!(make_uid, uid);
stat_int_field!(make_gid, gid);
stat_int_field!(make_ino, ino);
stat_int_field!(make_dev, dev);
stat_int_field!(make_nlink, nlink);

macro_rules! time_fields {
    ($accessor:ident, $secs:ident, $ms:ident, $us:ident, $ns:ident, $float:ident) => {
        fn $secs(file: &mut dyn FileResult, _ctx: &RenderCtx<'_>) -> Option<Value> {
            let (secs, _nanos) = systime_parts(file.$accessor()?);
            Some(Value::from(secs))
        }
        fn $ms(file: &mut dyn FileResult, _ctx: &RenderCtx<'_>) -> Option<Value> {
            let (secs, nanos) = systime_parts(file.$accessor()?);
            Some(Value::from(secs * 1000 + i64::from(nanos) / 1_000_000))
        }
        fn $us(file: &mut dyn FileResult, _ctx: &RenderCtx<'_>) -> Option<Value> {
            let (secs, nanos) = systime_parts(file.$accessor()?);
            Some(Value::from(secs * 1_000_000 + i64::from(nanos) / 1_000))
        }
        fn $ns(file: &mut dyn FileResult, _ctx: &RenderCtx<'_>) -> Option<Value> {
            let (secs, nanos) = systime_parts(file.$accessor()?);
            Some(Value::from(secs * 1_000_000_000 + i64::from(nanos)))
        }
        fn $float(file: &mut dyn FileResult, _ctx: &RenderCtx<'_>) -> Option<Value> {
            let (secs, nanos) = systime_parts(file.$accessor()?);
            Some(Value::from(secs as f64 + nanos as f64 * 1e-9))
        }
    };
}

time_fields!(
    accessed_time,
    make_atime,
    make_atime_ms,
    make_atime_us,
    make_atime_ns,
    make_atime_f
);
time_fields!(
    modified_time,
    make_mtime,
    make_mtime_ms,
    make_mtime_us,
    make_mtime_ns,
    make_mtime_f
);
time_fields!(
    changed_time,
    make_ctime,
    make_ctime_ms,
    make_ctime_us,
    make_ctime_ns,
    make_ctime_f
);

macro_rules! field {
    ($name:literal, $render:ident) => {
        FieldRenderer {
            name: $name,
            render: $render,
        }
    };
}

static FIELD_DEFS: &[FieldRenderer] = &[
    field!("name", make_name),
    field!("symlink_target", make_symlink_target),
    field!("exists", make_exists),
    field!("size", make_size),
    field!("mode", make_mode),
    field!("uid", make_uid),
    field!("gid", make_gid),
    field!("ino", make_ino),
    field!("dev", make_dev),
    field!("nlink", make_nlink),
    field!("new", make_new),
    field!("oclock", make_oclock),
    field!("cclock", make_cclock),
    field!("type", make_type),
    field!("content.sha1hex", make_content_sha1hex),
    field!("atime", make_atime),
    field!("atime_ms", make_atime_ms),
    field!("atime_us", make_atime_us),
    field!("atime_ns", make_atime_ns),
    field!("atime_f", make_atime_f),
    field!("mtime", make_mtime),
    field!("mtime_ms", make_mtime_ms),
    field!("mtime_us", make_mtime_us),
    field!("mtime_ns", make_mtime_ns),
    field!("mtime_f", make_mtime_f),
    field!("ctime", make_ctime),
    field!("ctime_ms", make_ctime_ms),
    field!("ctime_us", make_ctime_us),
    field!("ctime_ns", make_ctime_ns),
    field!("ctime_f", make_ctime_f),
];

pub fn find_field(name: &str) -> Option<&'static FieldRenderer> {
    FIELD_DEFS.iter().find(|field| field.name == name)
}

/// Default field set used when the query does not name any.
const DEFAULT_FIELDS: &[&str] = &[
    "name", "exists", "new", "size", "mode",
];

pub fn parse_field_list(fields: Option<&Value>) -> Result<FieldList, QueryParseError> {
    let names: Vec<&str> = match fields {
        None => DEFAULT_FIELDS.to_vec(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| QueryParseError::new("field name must be a string"))
            })
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(QueryParseError::new("field list must be an array of strings"));
        }
    };
    names
        .into_iter()
        .map(|name| {
            find_field(name)
                .ok_or_else(|| QueryParseError::new(format!("unknown field name '{name}'")))
        })
        .collect()
}

/// Renders the selected fields for one file. A single-field list renders as
/// the bare value; otherwise an object keyed by field name. Returns `None`
/// when any renderer still needs data.
pub fn file_result_to_json(
    fields: &FieldList,
    file: &mut dyn FileResult,
    ctx: &RenderCtx<'_>,
) -> Option<Value> {
    if fields.len() == 1 {
        return fields[0].render(file, ctx);
    }
    let mut object = serde_json::Map::with_capacity(fields.len());
    for field in fields {
        object.insert(field.name.to_owned(), field.render(file, ctx)?);
    }
    Some(Value::Object(object))
}
