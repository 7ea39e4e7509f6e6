//! Conversions between host [`Value`]s and raw C memory: scalar
//! coercions, member and element access, struct/array initializers,
//! bitfield packing, cdata operator emulation, and the flat argument
//! frames the compiled call stubs consume.

use std::ffi::{CString, c_void};
use std::ptr;

use crate::error::MarshalError;
use crate::jit::{CallPlan, RetPlan};
use crate::types::{CType, PTR_SIZE, TypeArena, TypeKind};
use crate::value::{CData, Value};

fn convert_err(v: &Value, ct: &CType, arena: &TypeArena) -> MarshalError {
    MarshalError::Convert {
        index: None,
        from: v.kind_name().to_string(),
        to: ct.name(arena).to_string(),
    }
}

fn describe(v: &Value, arena: &TypeArena) -> String {
    match v {
        Value::CData(cd) => cd.ctype.name(arena).to_string(),
        other => other.kind_name().to_string(),
    }
}

/// Outermost array level stripped; what the value decays to when used.
fn decayed(ct: &CType) -> CType {
    let mut ct = *ct;
    ct.is_array = false;
    ct.is_variable_array = false;
    ct.array_size = 0;
    ct
}

/// One array level removed entirely, leaving the element type.
fn element_type(ct: &CType) -> CType {
    let mut elem = *ct;
    elem.is_array = false;
    elem.is_variable_array = false;
    elem.array_size = 0;
    elem.pointers -= 1;
    elem
}

// ---------------------------------------------------------------- reads

/// Reads a scalar or pointer value of type `ct` at `p`. Multi-byte loads
/// are unaligned because packed layouts are legal.
pub(crate) unsafe fn read_scalar(ct: &CType, p: *const u8) -> Value {
    if ct.is_pointer() || ct.kind == TypeKind::Func {
        let addr = unsafe { (p as *const *mut c_void).read_unaligned() };
        let mut pt = *ct;
        pt.is_reference = false;
        return Value::CData(CData::from_ptr(pt, addr));
    }

    unsafe {
        match ct.kind {
            TypeKind::Bool => Value::Bool(p.read() != 0),
            TypeKind::I8 => Value::Int((p as *const i8).read() as i64),
            TypeKind::U8 => Value::Int(p.read() as i64),
            TypeKind::I16 => Value::Int((p as *const i16).read_unaligned() as i64),
            TypeKind::U16 => Value::Int((p as *const u16).read_unaligned() as i64),
            TypeKind::I32 => Value::Int((p as *const i32).read_unaligned() as i64),
            TypeKind::U32 => Value::Int((p as *const u32).read_unaligned() as i64),
            TypeKind::Enum => Value::Int((p as *const i32).read_unaligned() as i64),
            TypeKind::I64 => Value::Int((p as *const i64).read_unaligned()),
            TypeKind::U64 | TypeKind::UIntPtr => {
                // 64-bit unsigned values travel as their bit pattern
                Value::Int((p as *const u64).read_unaligned() as i64)
            }
            TypeKind::Float => Value::Float((p as *const f32).read_unaligned() as f64),
            TypeKind::Double => Value::Float((p as *const f64).read_unaligned()),
            TypeKind::Void | TypeKind::Struct | TypeKind::Union | TypeKind::Func => {
                unreachable!("aggregate read as scalar")
            }
        }
    }
}

/// Numeric payload of a cdata, when it has one.
fn scalar_of(cd: &CData) -> Option<Value> {
    let ct = cd.ctype;
    if ct.is_pointer() || ct.is_array || ct.kind.is_record() || ct.kind == TypeKind::Func {
        return None;
    }
    if !ct.kind.is_integer() && !ct.kind.is_float() {
        return None;
    }
    Some(unsafe { read_scalar(&ct, cd.value_ptr()) })
}

fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Bool(b) => Some(*b as i64),
        Value::Int(i) => Some(*i),
        Value::Float(f) => Some(*f as i64),
        Value::CData(cd) => match scalar_of(cd)? {
            Value::Bool(b) => Some(b as i64),
            Value::Int(i) => Some(i),
            Value::Float(f) => Some(f as i64),
            _ => None,
        },
        _ => None,
    }
}

fn as_float(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::CData(cd) => match scalar_of(cd)? {
            Value::Int(i) => Some(i as f64),
            Value::Float(f) => Some(f),
            _ => None,
        },
        _ => None,
    }
}

/// Address of whatever a pointer-shaped cdata designates: the stored
/// pointer, or the payload itself for arrays and record values.
fn cdata_address(cd: &CData) -> Option<*mut u8> {
    let ct = cd.ctype;
    if ct.is_array || (ct.kind.is_record() && ct.ptr_depth() == 0) {
        Some(cd.value_ptr())
    } else if ct.is_pointer() || ct.kind == TypeKind::Func {
        Some(unsafe { (cd.value_ptr() as *const *mut u8).read_unaligned() })
    } else {
        None
    }
}

/// Loose address conversion used by casts and `uintptr_t` targets; plain
/// numbers are reinterpreted as addresses here, unlike checked pointer
/// assignment.
fn as_address(v: &Value) -> Option<u64> {
    match v {
        Value::Nil => Some(0),
        Value::Bool(b) => Some(*b as u64),
        Value::Int(i) => Some(*i as u64),
        Value::Float(f) => Some(*f as u64),
        Value::Ptr(p) => Some(*p as u64),
        Value::CData(cd) => {
            if let Some(addr) = cdata_address(cd) {
                return Some(addr as u64);
            }
            match scalar_of(cd)? {
                Value::Bool(b) => Some(b as u64),
                Value::Int(i) => Some(i as u64),
                Value::Float(f) => Some(f as u64),
                _ => None,
            }
        }
        _ => None,
    }
}

fn named_convert(v: &Value, to: &str) -> MarshalError {
    MarshalError::Convert {
        index: None,
        from: v.kind_name().to_string(),
        to: to.to_string(),
    }
}

pub fn to_i32(v: &Value) -> Result<i32, MarshalError> {
    as_int(v).map(|x| x as i32).ok_or_else(|| named_convert(v, "int"))
}

pub fn to_u32(v: &Value) -> Result<u32, MarshalError> {
    as_int(v)
        .map(|x| x as u32)
        .ok_or_else(|| named_convert(v, "unsigned int"))
}

pub fn to_i64(v: &Value) -> Result<i64, MarshalError> {
    as_int(v).ok_or_else(|| named_convert(v, "int64_t"))
}

pub fn to_u64(v: &Value) -> Result<u64, MarshalError> {
    as_int(v)
        .map(|x| x as u64)
        .ok_or_else(|| named_convert(v, "uint64_t"))
}

pub fn to_f64(v: &Value) -> Result<f64, MarshalError> {
    as_float(v).ok_or_else(|| named_convert(v, "double"))
}

pub fn to_uintptr(v: &Value) -> Result<u64, MarshalError> {
    as_address(v).ok_or_else(|| named_convert(v, "uintptr_t"))
}

pub fn to_pointer(v: &Value) -> Result<*mut c_void, MarshalError> {
    as_address(v)
        .map(|a| a as *mut c_void)
        .ok_or_else(|| named_convert(v, "void*"))
}

// --------------------------------------------------------------- writes

/// Checked pointer conversion. `void*` converts both ways, NULL was
/// handled by the caller, otherwise kind, arena handle and indirection
/// depth must match and const levels may only be gained.
fn pointer_compatible(dst: &CType, src: &CType) -> bool {
    if dst.is_void_ptr() || src.is_void_ptr() {
        return true;
    }
    if dst.kind != src.kind || dst.info != src.info {
        return false;
    }
    if dst.pointers != src.pointers {
        return false;
    }
    (src.const_mask & !dst.const_mask) == 0
}

fn write_scalar(
    ct: &CType,
    dst: *mut u8,
    v: &Value,
    arena: &TypeArena,
) -> Result<(), MarshalError> {
    unsafe {
        match ct.kind {
            TypeKind::Bool => {
                let x = as_int(v).ok_or_else(|| convert_err(v, ct, arena))?;
                dst.write((x != 0) as u8);
            }
            TypeKind::I8 | TypeKind::U8 => {
                let x = as_int(v).ok_or_else(|| convert_err(v, ct, arena))?;
                dst.write(x as u8);
            }
            TypeKind::I16 | TypeKind::U16 => {
                let x = as_int(v).ok_or_else(|| convert_err(v, ct, arena))?;
                (dst as *mut u16).write_unaligned(x as u16);
            }
            TypeKind::I32 | TypeKind::U32 | TypeKind::Enum => {
                let x = as_int(v).ok_or_else(|| convert_err(v, ct, arena))?;
                (dst as *mut u32).write_unaligned(x as u32);
            }
            TypeKind::I64 | TypeKind::U64 => {
                let x = as_int(v).ok_or_else(|| convert_err(v, ct, arena))?;
                (dst as *mut u64).write_unaligned(x as u64);
            }
            TypeKind::UIntPtr => {
                // pointer-sized integers accept addresses
                let x = as_address(v).ok_or_else(|| convert_err(v, ct, arena))?;
                (dst as *mut u64).write_unaligned(x);
            }
            TypeKind::Float => {
                let x = as_float(v).ok_or_else(|| convert_err(v, ct, arena))?;
                (dst as *mut f32).write_unaligned(x as f32);
            }
            TypeKind::Double => {
                let x = as_float(v).ok_or_else(|| convert_err(v, ct, arena))?;
                (dst as *mut f64).write_unaligned(x);
            }
            TypeKind::Void | TypeKind::Struct | TypeKind::Union | TypeKind::Func => {
                unreachable!("non-scalar write")
            }
        }
    }
    Ok(())
}

fn write_pointer(
    ct: &CType,
    dst: *mut u8,
    v: &Value,
    arena: &TypeArena,
    keep: Option<&mut Vec<CString>>,
) -> Result<(), MarshalError> {
    let addr: *mut c_void = match v {
        Value::Nil | Value::Int(0) => ptr::null_mut(),
        Value::Ptr(p) => *p,
        Value::Str(s) => {
            // Strings are pinned per call; a stored string pointer would
            // dangle once the host value goes away.
            let Some(keep) = keep else {
                return Err(MarshalError::StringConvert);
            };
            let char_target = ct.kind.is_char() && ct.ptr_depth() == 1;
            if !char_target && !ct.is_void_ptr() {
                return Err(convert_err(v, ct, arena));
            }
            let c = CString::new(s.as_str()).map_err(|_| MarshalError::StringConvert)?;
            let p = c.as_ptr() as *mut c_void;
            keep.push(c);
            p
        }
        Value::CData(cd) => {
            let src = cd.ctype;
            if src.kind.is_record() && src.ptr_depth() == 0 && !src.is_array {
                // struct value adjusts to a single-level struct pointer
                let same = ct.kind == src.kind && ct.info == src.info && ct.ptr_depth() == 1;
                if !same && !ct.is_void_ptr() {
                    return Err(convert_err(v, ct, arena));
                }
                cd.value_ptr() as *mut c_void
            } else if src.is_pointer() || src.is_array || src.kind == TypeKind::Func {
                if !pointer_compatible(&decayed(ct), &decayed(&src)) {
                    return Err(convert_err(v, ct, arena));
                }
                match cdata_address(cd) {
                    Some(p) => p as *mut c_void,
                    None => unreachable!("pointer cdata without address"),
                }
            } else {
                return Err(convert_err(v, ct, arena));
            }
        }
        _ => return Err(convert_err(v, ct, arena)),
    };
    unsafe { (dst as *mut *mut c_void).write_unaligned(addr) };
    Ok(())
}

// ------------------------------------------------------------- bitfields

fn bits_mask(width: u32) -> u64 {
    if width >= 64 { u64::MAX } else { (1u64 << width) - 1 }
}

/// Loads only the bytes the field touches, so a field at the tail of a
/// packed struct never reads past the allocation. The scratch word is
/// 128 bits wide because a packed 64-bit field may start mid-byte and
/// span nine bytes.
pub(crate) unsafe fn read_bitfield(ct: &CType, p: *const u8) -> i64 {
    let off = ct.bit_offset as u32;
    let width = ct.bit_size as u32;
    let bytes = ((off + width + 7) / 8) as usize;

    let mut raw = [0u8; 16];
    unsafe { ptr::copy_nonoverlapping(p, raw.as_mut_ptr(), bytes) };
    let val = (u128::from_le_bytes(raw) >> off) as u64 & bits_mask(width);

    if ct.kind.is_unsigned() {
        val as i64
    } else {
        ((val << (64 - width)) as i64) >> (64 - width)
    }
}

pub(crate) unsafe fn write_bitfield(
    ct: &CType,
    p: *mut u8,
    v: &Value,
    arena: &TypeArena,
) -> Result<(), MarshalError> {
    let x = as_int(v).ok_or_else(|| convert_err(v, ct, arena))? as u64;
    let off = ct.bit_offset as u32;
    let width = ct.bit_size as u32;
    let bytes = ((off + width + 7) / 8) as usize;

    let mut raw = [0u8; 16];
    unsafe { ptr::copy_nonoverlapping(p, raw.as_mut_ptr(), bytes) };
    let mask = (bits_mask(width) as u128) << off;
    let word = (u128::from_le_bytes(raw) & !mask) | (((x as u128) << off) & mask);
    raw = word.to_le_bytes();
    unsafe { ptr::copy_nonoverlapping(raw.as_ptr(), p, bytes) };
    Ok(())
}

// ------------------------------------------------- member/element access

enum Target {
    /// Byte offset inside the cdata's own storage window.
    Own(usize),
    /// Address in memory the cdata merely points at.
    Foreign(*mut u8),
}

struct Place {
    ct: CType,
    target: Target,
}

impl Place {
    fn addr(&self, cd: &CData) -> *mut u8 {
        match self.target {
            Target::Own(off) => unsafe { cd.value_ptr().add(off) },
            Target::Foreign(p) => p,
        }
    }
}

fn resolve(cd: &CData, key: &Value, arena: &TypeArena) -> Result<Place, MarshalError> {
    let ct = cd.ctype;
    let not_indexable = || MarshalError::NotIndexable {
        type_name: ct.name(arena).to_string(),
    };

    match key {
        Value::Str(name) => {
            if !ct.kind.is_record() || ct.is_array || ct.ptr_depth() > 1 {
                return Err(not_indexable());
            }
            let id = match ct.info {
                Some(id) => id,
                None => return Err(not_indexable()),
            };
            let rec = arena.record(id);
            if !rec.defined {
                return Err(MarshalError::UndefinedInstance {
                    type_name: ct.name(arena).to_string(),
                });
            }
            let (mct, off) = rec.find(arena, name).ok_or_else(|| MarshalError::UnknownMember {
                type_name: ct.name(arena).to_string(),
                member: name.clone(),
            })?;

            if ct.ptr_depth() == 1 {
                // member access through a struct pointer dereferences it
                let base = unsafe { (cd.value_ptr() as *const *mut u8).read_unaligned() };
                if base.is_null() {
                    return Err(MarshalError::NullPointer);
                }
                Ok(Place {
                    ct: mct,
                    target: Target::Foreign(unsafe { base.add(off) }),
                })
            } else if ct.is_reference {
                Ok(Place {
                    ct: mct,
                    target: Target::Foreign(unsafe { cd.value_ptr().add(off) }),
                })
            } else {
                Ok(Place {
                    ct: mct,
                    target: Target::Own(off),
                })
            }
        }
        Value::Int(i) => {
            let i = *i as isize;
            if ct.is_array {
                let elem = element_type(&ct);
                let stride = if elem.is_pointer() { PTR_SIZE } else { elem.base_size(arena) };
                if stride == 0 {
                    return Err(not_indexable());
                }
                if i < 0 || ct.is_reference {
                    let p = unsafe { cd.value_ptr().offset(i * stride as isize) };
                    return Ok(Place {
                        ct: elem,
                        target: Target::Foreign(p),
                    });
                }
                Ok(Place {
                    ct: elem,
                    target: Target::Own(i as usize * stride),
                })
            } else if ct.is_pointer() {
                let stride = ct.element_size(arena);
                if stride == 0 {
                    return Err(not_indexable());
                }
                let base = unsafe { (cd.value_ptr() as *const *mut u8).read_unaligned() };
                if base.is_null() {
                    return Err(MarshalError::NullPointer);
                }
                let mut elem = ct;
                elem.pointers -= 1;
                Ok(Place {
                    ct: elem,
                    target: Target::Foreign(unsafe { base.offset(i * stride as isize) }),
                })
            } else {
                Err(not_indexable())
            }
        }
        _ => Err(not_indexable()),
    }
}

/// Member or element read. Aggregates come back as references into the
/// parent so the parent allocation stays alive; scalars come back as
/// plain host values.
pub fn index(cd: &CData, key: &Value, arena: &TypeArena) -> Result<Value, MarshalError> {
    let place = resolve(cd, key, arena)?;
    let mct = place.ct;

    if mct.is_bitfield {
        return Ok(Value::Int(unsafe { read_bitfield(&mct, place.addr(cd)) }));
    }
    if mct.is_array || (mct.kind.is_record() && mct.ptr_depth() == 0) {
        let len = mct.byte_size(arena).unwrap_or(0);
        let out = match place.target {
            Target::Own(off) => cd.view(mct, off, len),
            Target::Foreign(p) => {
                let mut rt = mct;
                rt.is_reference = true;
                CData::from_ptr(rt, p as *mut c_void)
            }
        };
        return Ok(Value::CData(out));
    }
    Ok(unsafe { read_scalar(&mct, place.addr(cd)) })
}

/// Member or element write.
pub fn newindex(
    cd: &CData,
    key: &Value,
    v: &Value,
    arena: &TypeArena,
) -> Result<(), MarshalError> {
    let place = resolve(cd, key, arena)?;
    let addr = place.addr(cd);
    if place.ct.is_bitfield {
        return unsafe { write_bitfield(&place.ct, addr, v, arena) };
    }
    let avail = place.ct.byte_size(arena).unwrap_or(0);
    write_value(&place.ct, addr, avail, v, arena, None)
}

/// Whole-cdata read: scalars and pointers materialize as host values,
/// everything else hands back the region.
pub fn get(cd: &CData) -> Value {
    let ct = cd.ctype;
    if ct.is_array || ct.kind.is_record() || ct.is_pointer() || ct.kind == TypeKind::Func {
        return Value::CData(cd.clone());
    }
    unsafe { read_scalar(&ct, cd.value_ptr()) }
}

/// Whole-cdata write.
pub fn set(cd: &CData, v: &Value, arena: &TypeArena) -> Result<(), MarshalError> {
    let mut ct = cd.ctype;
    ct.is_reference = false;
    let avail = ct.byte_size(arena).unwrap_or(cd.len());
    write_value(&ct, cd.value_ptr(), avail, v, arena, None)
}

/// Writes `v` into `avail` bytes of typed memory at `dst`. `keep` pins
/// temporary C strings and is only supplied on the call path.
pub(crate) fn write_value(
    ct: &CType,
    dst: *mut u8,
    avail: usize,
    v: &Value,
    arena: &TypeArena,
    keep: Option<&mut Vec<CString>>,
) -> Result<(), MarshalError> {
    if ct.is_bitfield {
        return unsafe { write_bitfield(ct, dst, v, arena) };
    }
    if ct.is_array {
        return write_array(ct, dst, avail, v, arena);
    }
    if ct.is_pointer() || ct.kind == TypeKind::Func {
        return write_pointer(ct, dst, v, arena, keep);
    }
    if ct.kind.is_record() {
        return write_record(ct, dst, v, arena);
    }
    write_scalar(ct, dst, v, arena)
}

fn write_array(
    ct: &CType,
    dst: *mut u8,
    avail: usize,
    v: &Value,
    arena: &TypeArena,
) -> Result<(), MarshalError> {
    let elem = element_type(ct);
    let stride = if elem.is_pointer() { PTR_SIZE } else { elem.base_size(arena) };
    let count = if ct.is_variable_array {
        if stride == 0 { 0 } else { avail / stride }
    } else {
        ct.array_len()
    };

    match v {
        Value::Str(s) if elem.ptr_depth() == 0 && elem.kind.is_char() => {
            let bytes = s.as_bytes();
            if bytes.len() > count {
                return Err(convert_err(v, ct, arena));
            }
            unsafe {
                ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
                ptr::write_bytes(dst.add(bytes.len()), 0, count - bytes.len());
            }
            Ok(())
        }
        Value::List(items) => {
            if items.len() > count {
                return Err(convert_err(v, ct, arena));
            }
            if items.len() == 1 && count > 1 {
                // lone entry fills every element
                for k in 0..count {
                    write_value(&elem, unsafe { dst.add(k * stride) }, stride, &items[0], arena, None)?;
                }
                return Ok(());
            }
            for (k, item) in items.iter().enumerate() {
                write_value(&elem, unsafe { dst.add(k * stride) }, stride, item, arena, None)?;
            }
            let used = items.len() * stride;
            unsafe { ptr::write_bytes(dst.add(used), 0, count * stride - used) };
            Ok(())
        }
        Value::CData(cd) => {
            let src = cd.ctype;
            if !pointer_compatible(&decayed(ct), &decayed(&src)) {
                return Err(convert_err(v, ct, arena));
            }
            let from = match cdata_address(cd) {
                Some(p) => p,
                None => return Err(convert_err(v, ct, arena)),
            };
            // only a concrete source array bounds the copy; pointers are
            // trusted for the full destination
            let total = count * stride;
            let n = if src.is_array && !src.is_reference {
                cd.len().min(total)
            } else {
                total
            };
            unsafe { ptr::copy_nonoverlapping(from, dst, n) };
            Ok(())
        }
        Value::Nil => {
            unsafe { ptr::write_bytes(dst, 0, count * stride) };
            Ok(())
        }
        // a single scalar broadcast-fills the array
        other => {
            for k in 0..count {
                write_value(&elem, unsafe { dst.add(k * stride) }, stride, other, arena, None)?;
            }
            Ok(())
        }
    }
}

fn write_member(
    mct: &CType,
    p: *mut u8,
    v: &Value,
    arena: &TypeArena,
) -> Result<(), MarshalError> {
    if mct.is_bitfield {
        return unsafe { write_bitfield(mct, p, v, arena) };
    }
    let avail = mct.byte_size(arena).unwrap_or(0);
    write_value(mct, p, avail, v, arena, None)
}

fn write_record(
    ct: &CType,
    dst: *mut u8,
    v: &Value,
    arena: &TypeArena,
) -> Result<(), MarshalError> {
    let id = match ct.info {
        Some(id) => id,
        None => unreachable!("record without info"),
    };
    let rec = arena.record(id);
    if !rec.defined {
        return Err(MarshalError::UndefinedInstance {
            type_name: ct.name(arena).to_string(),
        });
    }

    match v {
        Value::Record(entries) => {
            for (name, item) in entries {
                let (mct, off) = rec.find(arena, name).ok_or_else(|| MarshalError::UnknownMember {
                    type_name: ct.name(arena).to_string(),
                    member: name.clone(),
                })?;
                write_member(&mct, unsafe { dst.add(off) }, item, arena)?;
            }
            Ok(())
        }
        Value::List(items) => {
            if rec.is_union {
                if items.len() > 1 {
                    return Err(convert_err(v, ct, arena));
                }
                if let (Some(item), Some(m)) = (items.first(), rec.members.first()) {
                    write_member(&m.ctype, unsafe { dst.add(m.offset) }, item, arena)?;
                }
                return Ok(());
            }
            if items.len() > rec.members.len() {
                return Err(convert_err(v, ct, arena));
            }
            if items.len() == 1 && rec.members.len() > 1 {
                for m in &rec.members {
                    write_member(&m.ctype, unsafe { dst.add(m.offset) }, &items[0], arena)?;
                }
                return Ok(());
            }
            for (m, item) in rec.members.iter().zip(items) {
                write_member(&m.ctype, unsafe { dst.add(m.offset) }, item, arena)?;
            }
            Ok(())
        }
        Value::CData(cd) => {
            let src = cd.ctype;
            let same = src.kind == ct.kind && src.info == ct.info && !src.is_array;
            if !same || src.ptr_depth() > 1 {
                return Err(convert_err(v, ct, arena));
            }
            let from = if src.ptr_depth() == 1 {
                let p = unsafe { (cd.value_ptr() as *const *mut u8).read_unaligned() };
                if p.is_null() {
                    return Err(MarshalError::NullPointer);
                }
                p
            } else {
                cd.value_ptr()
            };
            unsafe { ptr::copy_nonoverlapping(from, dst, rec.size) };
            Ok(())
        }
        Value::Nil => {
            unsafe { ptr::write_bytes(dst, 0, rec.size) };
            Ok(())
        }
        // a lone scalar fills every member; unions take it in their
        // first member only
        other => {
            if rec.is_union {
                if let Some(m) = rec.members.first() {
                    write_member(&m.ctype, unsafe { dst.add(m.offset) }, other, arena)?;
                }
                return Ok(());
            }
            for m in &rec.members {
                write_member(&m.ctype, unsafe { dst.add(m.offset) }, other, arena)?;
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------- construction

/// Allocates and optionally initializes a value of `ct`. Variable-length
/// types take their element count as the initializer.
pub fn construct(ct: &CType, init: Option<&Value>, arena: &TypeArena) -> Result<CData, MarshalError> {
    let mut ct = *ct;
    ct.is_reference = false;

    if ct.kind == TypeKind::Void && !ct.is_pointer() {
        return Err(MarshalError::VoidInstance);
    }

    if (ct.is_variable_array || ct.is_variable_struct) && ct.ptr_depth() == 0 {
        let type_name = || MarshalError::VariableInstance {
            type_name: ct.name(arena).to_string(),
        };
        let n = match init {
            Some(v) => as_int(v).ok_or_else(type_name)?,
            None => return Err(type_name()),
        };
        if n < 0 {
            return Err(type_name());
        }
        let inc = ct.variable_increment as usize;
        let size = if ct.is_variable_struct {
            ct.base_size(arena) + n as usize * inc
        } else {
            n as usize * inc
        };
        if ct.is_variable_array {
            ct.array_size = n as u32;
        }
        ct.variable_size_known = true;
        return Ok(CData::new(ct, size));
    }

    if ct.ptr_depth() == 0 && !ct.is_defined(arena) {
        return Err(MarshalError::UndefinedInstance {
            type_name: ct.name(arena).to_string(),
        });
    }

    let size = match ct.byte_size(arena) {
        Some(s) => s,
        None => return Err(MarshalError::VoidInstance),
    };
    let cd = CData::new(ct, size);
    if let Some(v) = init {
        write_value(&ct, cd.base_ptr(), size, v, arena, None)?;
    }
    Ok(cd)
}

/// Unchecked conversion in the C cast sense: any address-like value can
/// become any pointer, integers and pointers reinterpret freely.
pub fn cast(ct: &CType, v: &Value, arena: &TypeArena) -> Result<CData, MarshalError> {
    let mut ct = *ct;
    ct.is_reference = false;

    if ct.is_array {
        return construct(&ct, Some(v), arena);
    }
    if ct.is_pointer() || ct.kind == TypeKind::Func {
        let addr = as_address(v).ok_or_else(|| convert_err(v, &ct, arena))?;
        let cd = CData::from_ptr(ct, addr as *mut c_void);
        // a callback source keeps its trampoline alive through the cast
        if let Value::CData(src) = v {
            if let Some(closure) = src.closure() {
                return Ok(CData::from_closure(ct, closure.clone()));
            }
        }
        return Ok(cd);
    }
    if ct.kind.is_record() {
        if let Value::CData(cd) = v {
            let src = cd.ctype;
            if src.kind == ct.kind && src.info == ct.info && src.ptr_depth() == 0 {
                let size = match ct.byte_size(arena) {
                    Some(s) => s,
                    None => {
                        return Err(MarshalError::UndefinedInstance {
                            type_name: ct.name(arena).to_string(),
                        });
                    }
                };
                let out = CData::new(ct, size);
                unsafe { ptr::copy_nonoverlapping(cd.value_ptr(), out.base_ptr(), size) };
                return Ok(out);
            }
        }
        return Err(convert_err(v, &ct, arena));
    }
    if ct.kind == TypeKind::Void {
        return Err(MarshalError::VoidInstance);
    }

    let out = CData::new(ct, ct.kind.size());
    if ct.kind.is_integer() {
        let x = as_address(v).ok_or_else(|| convert_err(v, &ct, arena))?;
        match ct.kind.size() {
            1 => unsafe { out.base_ptr().write(x as u8) },
            2 => unsafe { (out.base_ptr() as *mut u16).write(x as u16) },
            4 => unsafe { (out.base_ptr() as *mut u32).write(x as u32) },
            _ => unsafe { (out.base_ptr() as *mut u64).write(x) },
        }
    } else {
        let x = as_float(v).ok_or_else(|| convert_err(v, &ct, arena))?;
        match ct.kind {
            TypeKind::Float => unsafe { (out.base_ptr() as *mut f32).write(x as f32) },
            _ => unsafe { (out.base_ptr() as *mut f64).write(x) },
        }
    }
    Ok(out)
}

/// Nominal type test: same kind, same arena handle, same shape.
pub fn istype(ct: &CType, v: &Value) -> bool {
    let Value::CData(cd) = v else { return false };
    let other = cd.ctype;
    ct.kind == other.kind
        && ct.info == other.info
        && ct.pointers == other.pointers
        && ct.is_array == other.is_array
}

// -------------------------------------------------------------- strings

/// Bytes behind a string-ish value: the string itself, or memory read
/// through a pointer (bounded by `len`, else up to the first NUL).
pub fn to_string_bytes(
    v: &Value,
    len: Option<usize>,
    arena: &TypeArena,
) -> Result<Vec<u8>, MarshalError> {
    match v {
        Value::Str(s) => {
            let bytes = s.as_bytes();
            let n = len.unwrap_or(bytes.len()).min(bytes.len());
            Ok(bytes[..n].to_vec())
        }
        Value::Ptr(p) => {
            if p.is_null() {
                return Err(MarshalError::NullPointer);
            }
            Ok(unsafe { read_c_bytes(*p as *const u8, len, None) })
        }
        Value::CData(cd) => {
            let p = cdata_address(cd).ok_or_else(|| named_convert(v, "string"))?;
            if p.is_null() {
                return Err(MarshalError::NullPointer);
            }
            // own arrays bound the scan at the allocation edge
            let bound = if cd.ctype.is_array && !cd.ctype.is_reference {
                Some(cd.len())
            } else {
                None
            };
            Ok(unsafe { read_c_bytes(p, len, bound) })
        }
        _ => Err(named_convert(v, "string")),
    }
}

unsafe fn read_c_bytes(p: *const u8, len: Option<usize>, bound: Option<usize>) -> Vec<u8> {
    if let Some(n) = len {
        let n = bound.map_or(n, |b| n.min(b));
        return unsafe { std::slice::from_raw_parts(p, n) }.to_vec();
    }
    let mut out = Vec::new();
    let mut i = 0usize;
    loop {
        if let Some(b) = bound {
            if i >= b {
                break;
            }
        }
        let c = unsafe { p.add(i).read() };
        if c == 0 {
            break;
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Raw destination/source address for `copy` and `fill`.
pub(crate) fn address_for_copy(v: &Value) -> Result<*mut u8, MarshalError> {
    match v {
        Value::Ptr(p) => Ok(*p as *mut u8),
        Value::CData(cd) => cdata_address(cd).ok_or_else(|| named_convert(v, "void*")),
        _ => Err(named_convert(v, "void*")),
    }
}

// ------------------------------------------------------------- operators

/// Operator selector for cdata arithmetic and the hook table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    Eq,
    Lt,
    Le,
}

/// Per-type host overrides, consulted before the builtin behavior. Each
/// hook may decline by returning `None` (or `false` for stores).
#[derive(Default)]
pub struct TypeHooks {
    pub index: Option<Box<dyn Fn(&CData, &Value) -> Option<Value>>>,
    pub newindex: Option<Box<dyn Fn(&CData, &Value, &Value) -> bool>>,
    pub arith: Option<Box<dyn Fn(ArithOp, &Value, Option<&Value>) -> Option<Value>>>,
    pub call: Option<Box<dyn Fn(&CData, &[Value]) -> Option<Value>>>,
}

enum Num {
    Int { val: i64, rank: u8 },
    Float(f64),
    Ptr { addr: usize, ct: CType },
}

fn int_rank(kind: TypeKind) -> u8 {
    match kind {
        TypeKind::UIntPtr => 4,
        TypeKind::U64 => 3,
        TypeKind::I64 => 2,
        _ => 0,
    }
}

fn numeric(v: &Value) -> Option<Num> {
    match v {
        Value::Bool(b) => Some(Num::Int { val: *b as i64, rank: 0 }),
        Value::Int(i) => Some(Num::Int { val: *i, rank: 0 }),
        Value::Float(f) => Some(Num::Float(*f)),
        Value::Ptr(p) => {
            let mut ct = CType::scalar(TypeKind::Void);
            ct.pointers = 1;
            Some(Num::Ptr { addr: *p as usize, ct })
        }
        Value::CData(cd) => {
            let ct = cd.ctype;
            if ct.is_pointer() || ct.is_array || ct.kind == TypeKind::Func {
                let addr = cdata_address(cd)? as usize;
                return Some(Num::Ptr { addr, ct: decayed(&ct) });
            }
            match scalar_of(cd)? {
                Value::Bool(b) => Some(Num::Int { val: b as i64, rank: 0 }),
                Value::Int(i) => Some(Num::Int { val: i, rank: int_rank(ct.kind) }),
                Value::Float(f) => Some(Num::Float(f)),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Result rank decides the box: 64-bit results come back as cdata so no
/// precision is lost, everything below stays a plain host integer.
fn box_int(val: i64, rank: u8) -> Value {
    let kind = match rank {
        4 => TypeKind::UIntPtr,
        3 => TypeKind::U64,
        2 => TypeKind::I64,
        _ => return Value::Int(val),
    };
    let cd = CData::new(CType::scalar(kind), 8);
    unsafe { (cd.base_ptr() as *mut i64).write(val) };
    Value::CData(cd)
}

fn int_pow(base: i64, exp: i64) -> i64 {
    if exp < 0 {
        return match base {
            1 => 1,
            -1 => {
                if exp % 2 == 0 { 1 } else { -1 }
            }
            _ => 0,
        };
    }
    let mut acc = 1i64;
    let mut b = base;
    let mut e = exp as u64;
    while e > 0 {
        if e & 1 == 1 {
            acc = acc.wrapping_mul(b);
        }
        b = b.wrapping_mul(b);
        e >>= 1;
    }
    acc
}

/// Pointer arithmetic stride; zero when the pointee size is unknown.
fn ptr_stride(ct: &CType, arena: &TypeArena) -> usize {
    ct.element_size(arena)
}

/// Arithmetic and comparison emulation on cdata operands. `b` is `None`
/// for unary negation.
pub fn arith(
    op: ArithOp,
    a: &Value,
    b: Option<&Value>,
    arena: &TypeArena,
) -> Result<Value, MarshalError> {
    let bad_operand = |v: &Value| named_convert(v, "number");
    let lhs = numeric(a).ok_or_else(|| bad_operand(a))?;

    if op == ArithOp::Neg {
        return match lhs {
            Num::Int { val, rank } => Ok(box_int(val.wrapping_neg(), rank)),
            Num::Float(f) => Ok(Value::Float(-f)),
            Num::Ptr { .. } => Err(MarshalError::PointerArith {
                lhs: describe(a, arena),
                rhs: "unary minus".to_string(),
            }),
        };
    }

    let bv = match b {
        Some(v) => v,
        None => unreachable!("binary operator without right operand"),
    };
    let rhs = numeric(bv).ok_or_else(|| bad_operand(bv))?;

    if matches!(op, ArithOp::Eq | ArithOp::Lt | ArithOp::Le) {
        return compare(op, &lhs, &rhs, a, bv, arena);
    }

    match (&lhs, &rhs) {
        (Num::Ptr { addr, ct }, Num::Int { val, .. }) => {
            let stride = ptr_stride(ct, arena);
            if stride == 0 || !matches!(op, ArithOp::Add | ArithOp::Sub) {
                return Err(MarshalError::PointerArith {
                    lhs: describe(a, arena),
                    rhs: describe(bv, arena),
                });
            }
            let delta = (*val as isize).wrapping_mul(stride as isize);
            let out = if op == ArithOp::Add {
                addr.wrapping_add_signed(delta)
            } else {
                addr.wrapping_sub(delta as usize)
            };
            Ok(Value::CData(CData::from_ptr(*ct, out as *mut c_void)))
        }
        (Num::Int { val, .. }, Num::Ptr { addr, ct }) => {
            let stride = ptr_stride(ct, arena);
            if stride == 0 || op != ArithOp::Add {
                return Err(MarshalError::PointerArith {
                    lhs: describe(a, arena),
                    rhs: describe(bv, arena),
                });
            }
            let out = addr.wrapping_add_signed((*val as isize).wrapping_mul(stride as isize));
            Ok(Value::CData(CData::from_ptr(*ct, out as *mut c_void)))
        }
        (Num::Ptr { .. }, _) | (_, Num::Ptr { .. }) => Err(MarshalError::PointerArith {
            lhs: describe(a, arena),
            rhs: describe(bv, arena),
        }),
        (Num::Float(_), _) | (_, Num::Float(_)) => {
            let x = float_of(&lhs);
            let y = float_of(&rhs);
            Ok(Value::Float(match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::Div => x / y,
                ArithOp::Mod => x % y,
                ArithOp::Pow => x.powf(y),
                _ => unreachable!("comparison handled above"),
            }))
        }
        (Num::Int { val: x, rank: rx }, Num::Int { val: y, rank: ry }) => {
            let rank = (*rx).max(*ry);
            let (x, y) = (*x, *y);
            if matches!(op, ArithOp::Div | ArithOp::Mod) && y == 0 {
                return Err(MarshalError::DivideByZero);
            }
            let out = if rank >= 3 {
                let (ux, uy) = (x as u64, y as u64);
                (match op {
                    ArithOp::Add => ux.wrapping_add(uy),
                    ArithOp::Sub => ux.wrapping_sub(uy),
                    ArithOp::Mul => ux.wrapping_mul(uy),
                    ArithOp::Div => ux / uy,
                    ArithOp::Mod => ux % uy,
                    ArithOp::Pow => int_pow(x, y) as u64,
                    _ => unreachable!("comparison handled above"),
                }) as i64
            } else {
                match op {
                    ArithOp::Add => x.wrapping_add(y),
                    ArithOp::Sub => x.wrapping_sub(y),
                    ArithOp::Mul => x.wrapping_mul(y),
                    ArithOp::Div => x.wrapping_div(y),
                    ArithOp::Mod => x.wrapping_rem(y),
                    ArithOp::Pow => int_pow(x, y),
                    _ => unreachable!("comparison handled above"),
                }
            };
            Ok(box_int(out, rank))
        }
    }
}

fn float_of(n: &Num) -> f64 {
    match n {
        Num::Int { val, .. } => *val as f64,
        Num::Float(f) => *f,
        Num::Ptr { .. } => unreachable!("pointer in float arithmetic"),
    }
}

fn compare(
    op: ArithOp,
    lhs: &Num,
    rhs: &Num,
    a: &Value,
    b: &Value,
    arena: &TypeArena,
) -> Result<Value, MarshalError> {
    let fail = || MarshalError::Compare {
        lhs: describe(a, arena),
        rhs: describe(b, arena),
    };

    let decide = |lt: bool, eq: bool| match op {
        ArithOp::Eq => Value::Bool(eq),
        ArithOp::Lt => Value::Bool(lt),
        ArithOp::Le => Value::Bool(lt || eq),
        _ => unreachable!("not a comparison"),
    };

    match (lhs, rhs) {
        (Num::Ptr { addr: x, ct: tx }, Num::Ptr { addr: y, ct: ty }) => {
            let compatible = tx.is_void_ptr()
                || ty.is_void_ptr()
                || (tx.kind == ty.kind && tx.info == ty.info && tx.pointers == ty.pointers);
            if !compatible {
                return Err(fail());
            }
            Ok(decide(x < y, x == y))
        }
        (Num::Ptr { addr, .. }, Num::Int { val, rank }) => {
            // only a pointer-sized integer may meet a pointer
            if *rank < 4 {
                return Err(fail());
            }
            let y = *val as usize;
            Ok(decide(*addr < y, *addr == y))
        }
        (Num::Int { val, rank }, Num::Ptr { addr, .. }) => {
            if *rank < 4 {
                return Err(fail());
            }
            let x = *val as usize;
            Ok(decide(x < *addr, x == *addr))
        }
        (Num::Float(_), _) | (_, Num::Float(_)) => {
            let x = float_of(lhs);
            let y = float_of(rhs);
            Ok(decide(x < y, x == y))
        }
        (Num::Int { val: x, rank: rx }, Num::Int { val: y, rank: ry }) => {
            if (*rx).max(*ry) >= 3 {
                let (ux, uy) = (*x as u64, *y as u64);
                Ok(decide(ux < uy, ux == uy))
            } else {
                Ok(decide(x < y, x == y))
            }
        }
    }
}

// ------------------------------------------------------------ call path

/// Marshaled argument frame for one native call. `keep` pins string
/// temporaries until the frame drops; `ret` is the buffer for a memory-
/// class return.
#[derive(Debug)]
pub(crate) struct Frame {
    pub words: Vec<u64>,
    pub ret: Option<CData>,
    #[allow(dead_code)]
    keep: Vec<CString>,
}

pub(crate) fn build_frame(
    plan: &CallPlan,
    ret_ct: &CType,
    arg_types: &[CType],
    args: &[Value],
    arena: &TypeArena,
) -> Result<Frame, MarshalError> {
    debug_assert_eq!(arg_types.len(), args.len());
    debug_assert_eq!(plan.arg_slots.len(), args.len());

    let mut frame = Frame {
        words: vec![0u64; plan.frame_words as usize],
        ret: None,
        keep: Vec::new(),
    };

    if plan.ret == RetPlan::Memory {
        let size = match ret_ct.byte_size(arena) {
            Some(s) => s,
            None => unreachable!("memory-class return without a size"),
        };
        let ret = CData::new(*ret_ct, size);
        frame.words[0] = ret.base_ptr() as u64;
        frame.ret = Some(ret);
    }

    for (i, (ct, v)) in arg_types.iter().zip(args).enumerate() {
        let slot = plan.arg_slots[i];
        let dst = unsafe { frame.words.as_mut_ptr().add(slot.word as usize) } as *mut u8;
        let avail = slot.words as usize * 8;
        write_value(ct, dst, avail, v, arena, Some(&mut frame.keep)).map_err(|e| match e {
            MarshalError::Convert { index: None, from, to } => MarshalError::Convert {
                index: Some(i + 1),
                from,
                to,
            },
            other => other,
        })?;
    }
    Ok(frame)
}

/// Turns the raw return registers back into a host value.
pub(crate) fn read_ret(
    ret_ct: &CType,
    plan: &CallPlan,
    raw: &[u64; 2],
    ret_cd: Option<CData>,
    arena: &TypeArena,
) -> Value {
    match plan.ret {
        RetPlan::Void => Value::Nil,
        RetPlan::Memory => match ret_cd {
            Some(cd) => Value::CData(cd),
            None => unreachable!("memory return without buffer"),
        },
        _ => {
            if ret_ct.kind.is_record() && ret_ct.ptr_depth() == 0 {
                let size = match ret_ct.byte_size(arena) {
                    Some(s) => s.min(16),
                    None => unreachable!("register-class record without a size"),
                };
                let cd = CData::new(*ret_ct, ret_ct.byte_size(arena).unwrap_or(size));
                unsafe {
                    ptr::copy_nonoverlapping(raw.as_ptr() as *const u8, cd.base_ptr(), size)
                };
                Value::CData(cd)
            } else {
                unsafe { read_scalar(ret_ct, raw.as_ptr() as *const u8) }
            }
        }
    }
}

/// Default argument promotion for one variadic trailing argument.
pub(crate) fn promote_vararg(v: &Value, arena: &TypeArena) -> Result<CType, MarshalError> {
    let void_ptr = || {
        let mut ct = CType::scalar(TypeKind::Void);
        ct.pointers = 1;
        ct
    };
    Ok(match v {
        Value::Nil | Value::Ptr(_) => void_ptr(),
        Value::Bool(_) => CType::scalar(TypeKind::I32),
        Value::Int(_) => CType::scalar(TypeKind::I64),
        Value::Float(_) => CType::scalar(TypeKind::Double),
        Value::Str(_) => {
            let mut ct = CType::scalar(TypeKind::I8);
            ct.pointers = 1;
            ct
        }
        Value::CData(cd) => {
            let ct = cd.ctype;
            if ct.is_array || ct.is_pointer() || ct.kind == TypeKind::Func {
                decayed(&ct)
            } else if ct.kind.is_float() {
                CType::scalar(TypeKind::Double)
            } else if ct.kind.is_integer() {
                CType::scalar(TypeKind::I64)
            } else if ct.kind.is_record() {
                ct
            } else {
                return Err(named_convert(v, "vararg"));
            }
        }
        _ => return Err(named_convert(v, "vararg")),
    })
}

/// Builds the host value for one incoming callback argument.
pub(crate) unsafe fn callback_arg(ct: &CType, word: *const u64, arena: &TypeArena) -> Value {
    if ct.kind.is_record() && ct.ptr_depth() == 0 && !ct.is_array {
        let size = match ct.byte_size(arena) {
            Some(s) => s,
            None => return Value::Nil,
        };
        let cd = CData::new(*ct, size);
        unsafe { ptr::copy_nonoverlapping(word as *const u8, cd.base_ptr(), size) };
        return Value::CData(cd);
    }
    unsafe { read_scalar(ct, word as *const u8) }
}

/// Writes the callback result where the trampoline picks up its return
/// registers.
pub(crate) unsafe fn callback_ret(
    ret_ct: &CType,
    plan: &CallPlan,
    v: &Value,
    words: *const u64,
    ret: *mut u64,
    arena: &TypeArena,
) -> Result<(), MarshalError> {
    match plan.ret {
        RetPlan::Void => Ok(()),
        RetPlan::Memory => {
            // hidden result pointer was spilled to frame word 0
            let dst = unsafe { words.read() } as *mut u8;
            if dst.is_null() {
                return Err(MarshalError::NullPointer);
            }
            let size = ret_ct.byte_size(arena).unwrap_or(0);
            write_value(ret_ct, dst, size, v, arena, None)
        }
        _ => {
            if ret_ct.kind.is_record() && ret_ct.ptr_depth() == 0 {
                let size = ret_ct.byte_size(arena).unwrap_or(0);
                return write_value(ret_ct, ret as *mut u8, size, v, arena, None);
            }
            if ret_ct.is_pointer() || ret_ct.kind == TypeKind::Func {
                let addr = as_address(v).ok_or_else(|| convert_err(v, ret_ct, arena))?;
                unsafe { ret.write(addr) };
                return Ok(());
            }
            match ret_ct.kind {
                TypeKind::Float => {
                    let x = as_float(v).ok_or_else(|| convert_err(v, ret_ct, arena))?;
                    unsafe { (ret as *mut f32).write(x as f32) };
                }
                TypeKind::Double => {
                    let x = as_float(v).ok_or_else(|| convert_err(v, ret_ct, arena))?;
                    unsafe { (ret as *mut f64).write(x) };
                }
                TypeKind::Bool => {
                    let x = as_int(v).ok_or_else(|| convert_err(v, ret_ct, arena))?;
                    unsafe { ret.write((x != 0) as u64) };
                }
                _ => {
                    // full-width store; the native caller reads its width
                    let x = as_int(v).ok_or_else(|| convert_err(v, ret_ct, arena))?;
                    unsafe { ret.write(x as u64) };
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{BitfieldPolicy, Parser};
    use crate::registry::Registry;

    fn parse(src: &str) -> Registry {
        let mut reg = Registry::new();
        Parser::new(src, &mut reg, BitfieldPolicy::default())
            .parse_all()
            .expect("parse failed");
        reg
    }

    fn type_of(reg: &mut Registry, spec: &str) -> CType {
        Parser::new(spec, reg, BitfieldPolicy::default())
            .parse_type_spec()
            .expect("type spec")
    }

    fn int_value(v: &Value) -> i64 {
        match v {
            Value::Int(i) => *i,
            other => panic!("expected integer, got {}", other.kind_name()),
        }
    }

    #[test]
    fn scalar_roundtrips() {
        let mut reg = Registry::new();
        let arena = reg.arena.clone();

        let cd = construct(&type_of(&mut reg, "int"), Some(&Value::Int(-5)), &arena)
            .expect("construct");
        assert_eq!(int_value(&get(&cd)), -5);

        let cd = construct(&type_of(&mut reg, "unsigned char"), Some(&Value::Int(300)), &arena)
            .expect("construct");
        assert_eq!(int_value(&get(&cd)), 44);

        let cd = construct(&type_of(&mut reg, "double"), Some(&Value::Float(2.5)), &arena)
            .expect("construct");
        assert!(matches!(get(&cd), Value::Float(f) if f == 2.5));

        let cd = construct(&type_of(&mut reg, "float"), Some(&Value::Float(1.5)), &arena)
            .expect("construct");
        assert!(matches!(get(&cd), Value::Float(f) if f == 1.5));

        let cd = construct(&type_of(&mut reg, "bool"), Some(&Value::Bool(true)), &arena)
            .expect("construct");
        assert!(matches!(get(&cd), Value::Bool(true)));
    }

    #[test]
    fn signed_chars_sign_extend() {
        let mut reg = Registry::new();
        let arena = reg.arena.clone();
        let cd = construct(&type_of(&mut reg, "char"), Some(&Value::Int(-1)), &arena)
            .expect("construct");
        assert_eq!(int_value(&get(&cd)), -1);
    }

    #[test]
    fn uint64_roundtrips_as_bits() {
        let mut reg = Registry::new();
        let arena = reg.arena.clone();
        let cd = construct(&type_of(&mut reg, "uint64_t"), Some(&Value::Int(-1)), &arena)
            .expect("construct");
        assert_eq!(int_value(&get(&cd)), -1);
    }

    #[test]
    fn struct_positional_and_named_initializers() {
        let mut reg = parse("struct pt { int x; int y; };");
        let arena = reg.arena.clone();
        let pt = type_of(&mut reg, "struct pt");

        let list = Value::List(vec![Value::Int(3), Value::Int(4)]);
        let cd = construct(&pt, Some(&list), &arena).expect("construct");
        assert_eq!(int_value(&index(&cd, &"x".into(), &arena).expect("x")), 3);
        assert_eq!(int_value(&index(&cd, &"y".into(), &arena).expect("y")), 4);

        let named = Value::Record(vec![("y".to_string(), Value::Int(7))]);
        let cd = construct(&pt, Some(&named), &arena).expect("construct");
        assert_eq!(int_value(&index(&cd, &"x".into(), &arena).expect("x")), 0);
        assert_eq!(int_value(&index(&cd, &"y".into(), &arena).expect("y")), 7);

        let err = construct(
            &pt,
            Some(&Value::Record(vec![("z".to_string(), Value::Int(1))])),
            &arena,
        )
        .expect_err("unknown member");
        assert!(matches!(err, MarshalError::UnknownMember { .. }));
    }

    #[test]
    fn lone_entry_broadcasts() {
        let mut reg = parse("struct pair { int a; int b; };");
        let arena = reg.arena.clone();

        let pair = type_of(&mut reg, "struct pair");
        let cd = construct(&pair, Some(&Value::List(vec![Value::Int(9)])), &arena)
            .expect("construct");
        assert_eq!(int_value(&index(&cd, &"a".into(), &arena).expect("a")), 9);
        assert_eq!(int_value(&index(&cd, &"b".into(), &arena).expect("b")), 9);

        let arr = type_of(&mut reg, "int[3]");
        let cd = construct(&arr, Some(&Value::Int(7)), &arena).expect("construct");
        for i in 0..3 {
            assert_eq!(int_value(&index(&cd, &Value::Int(i), &arena).expect("elem")), 7);
        }
    }

    #[test]
    fn unions_initialize_their_first_member_only() {
        let mut reg = parse("union u { unsigned int i; float f; };");
        let arena = reg.arena.clone();
        let u = type_of(&mut reg, "union u");

        let cd = construct(&u, None, &arena).expect("construct");
        newindex(&cd, &"f".into(), &Value::Float(1.0), &arena).expect("set f");
        // 1.0f shares storage with the integer view
        assert_eq!(int_value(&index(&cd, &"i".into(), &arena).expect("i")), 0x3F80_0000);

        let err = construct(
            &u,
            Some(&Value::List(vec![Value::Int(1), Value::Int(2)])),
            &arena,
        )
        .expect_err("too many union initializers");
        assert!(matches!(err, MarshalError::Convert { .. }));
    }

    #[test]
    fn char_arrays_take_strings() {
        let mut reg = Registry::new();
        let arena = reg.arena.clone();
        let arr = type_of(&mut reg, "char[8]");

        let cd = construct(&arr, Some(&"hi".into()), &arena).expect("construct");
        let bytes = to_string_bytes(&Value::CData(cd), None, &arena).expect("string");
        assert_eq!(bytes, b"hi");

        let err = construct(&arr, Some(&"a long string".into()), &arena)
            .expect_err("does not fit");
        assert!(matches!(err, MarshalError::Convert { .. }));
    }

    #[test]
    fn array_lists_zero_fill_the_tail() {
        let mut reg = Registry::new();
        let arena = reg.arena.clone();
        let arr = type_of(&mut reg, "int[4]");

        let init = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let cd = construct(&arr, Some(&init), &arena).expect("construct");
        assert_eq!(int_value(&index(&cd, &Value::Int(2), &arena).expect("e2")), 3);
        assert_eq!(int_value(&index(&cd, &Value::Int(3), &arena).expect("e3")), 0);
    }

    #[test]
    fn bitfields_read_and_write_in_place() {
        let mut reg = parse(
            "struct bits { unsigned short a:3; unsigned short b:6; \
             unsigned short c:5; unsigned short d:8; };",
        );
        let arena = reg.arena.clone();
        let cd = construct(&type_of(&mut reg, "struct bits"), None, &arena).expect("construct");

        newindex(&cd, &"a".into(), &Value::Int(5), &arena).expect("a");
        newindex(&cd, &"b".into(), &Value::Int(33), &arena).expect("b");
        newindex(&cd, &"c".into(), &Value::Int(17), &arena).expect("c");
        newindex(&cd, &"d".into(), &Value::Int(200), &arena).expect("d");

        assert_eq!(int_value(&index(&cd, &"a".into(), &arena).expect("a")), 5);
        assert_eq!(int_value(&index(&cd, &"b".into(), &arena).expect("b")), 33);
        assert_eq!(int_value(&index(&cd, &"c".into(), &arena).expect("c")), 17);
        assert_eq!(int_value(&index(&cd, &"d".into(), &arena).expect("d")), 200);

        // overwide stores truncate to the field width
        newindex(&cd, &"a".into(), &Value::Int(0xFF), &arena).expect("a");
        assert_eq!(int_value(&index(&cd, &"a".into(), &arena).expect("a")), 7);
        assert_eq!(int_value(&index(&cd, &"b".into(), &arena).expect("b")), 33);
    }

    #[test]
    fn packed_bitfields_may_straddle_a_word_boundary() {
        // With pack(1) the window rule is gone: `wide` starts at bit 3
        // and its 62 bits span nine bytes.
        let mut reg = parse("#pragma pack(1)\n struct span { char low : 3; uint64_t wide : 62; };");
        let arena = reg.arena.clone();
        let span = type_of(&mut reg, "struct span");
        assert_eq!(span.byte_size(&arena), Some(9));

        let cd = construct(&span, None, &arena).expect("construct");
        newindex(&cd, &"low".into(), &Value::Int(2), &arena).expect("low");
        newindex(&cd, &"wide".into(), &Value::Int(0x3FFF_FFFF_FFFF_FFF0), &arena).expect("wide");

        assert_eq!(int_value(&index(&cd, &"low".into(), &arena).expect("low")), 2);
        assert_eq!(
            int_value(&index(&cd, &"wide".into(), &arena).expect("wide")),
            0x3FFF_FFFF_FFFF_FFF0
        );
    }

    #[test]
    fn struct_pointers_deref_on_member_access() {
        let mut reg = parse("struct node { int v; struct node *next; };");
        let arena = reg.arena.clone();
        let node = type_of(&mut reg, "struct node");

        let first = construct(&node, None, &arena).expect("construct");
        let second = construct(&node, None, &arena).expect("construct");
        newindex(&second, &"v".into(), &Value::Int(42), &arena).expect("v");
        // struct value auto-adjusts to struct pointer on assignment
        newindex(&first, &"next".into(), &Value::CData(second.clone()), &arena).expect("next");

        let next = match index(&first, &"next".into(), &arena).expect("next") {
            Value::CData(cd) => cd,
            other => panic!("expected cdata, got {}", other.kind_name()),
        };
        assert_eq!(int_value(&index(&next, &"v".into(), &arena).expect("v")), 42);

        let null = construct(&node, None, &arena).expect("construct");
        let through = index(&null, &"next".into(), &arena).expect("next");
        let Value::CData(nullp) = through else { panic!("expected cdata") };
        let err = index(&nullp, &"v".into(), &arena).expect_err("null deref");
        assert!(matches!(err, MarshalError::NullPointer));
    }

    #[test]
    fn pointer_assignment_is_checked() {
        let mut reg = parse("struct a { int x; }; struct b { int x; };");
        let arena = reg.arena.clone();

        let pa = type_of(&mut reg, "struct a*");
        let vb = construct(&type_of(&mut reg, "struct b"), None, &arena).expect("construct");

        let mut buf = [0u8; 8];
        let err = write_value(&pa, buf.as_mut_ptr(), 8, &Value::CData(vb.clone()), &arena, None)
            .expect_err("wrong struct");
        assert!(matches!(err, MarshalError::Convert { .. }));

        // void* takes anything, NULL takes any pointer type
        let pv = type_of(&mut reg, "void*");
        write_value(&pv, buf.as_mut_ptr(), 8, &Value::CData(vb), &arena, None).expect("void*");
        write_value(&pa, buf.as_mut_ptr(), 8, &Value::Nil, &arena, None).expect("null");
    }

    #[test]
    fn variable_arrays_take_their_count() {
        let mut reg = Registry::new();
        let arena = reg.arena.clone();
        let arr = type_of(&mut reg, "int[?]");

        let cd = construct(&arr, Some(&Value::Int(5)), &arena).expect("construct");
        assert_eq!(cd.len(), 20);

        let err = construct(&arr, None, &arena).expect_err("needs count");
        assert!(matches!(err, MarshalError::VariableInstance { .. }));
    }

    #[test]
    fn variable_structs_size_from_the_tail() {
        let mut reg = parse("struct vbuf { int n; char data[?]; };");
        let arena = reg.arena.clone();
        let cd = construct(&type_of(&mut reg, "struct vbuf"), Some(&Value::Int(7)), &arena)
            .expect("construct");
        assert_eq!(cd.len(), 4 + 7);
    }

    #[test]
    fn casts_reinterpret_freely() {
        let mut reg = parse("struct a { int x; };");
        let arena = reg.arena.clone();

        let ip = type_of(&mut reg, "int*");
        let cd = cast(&ip, &Value::Int(0x1000), &arena).expect("cast");
        assert_eq!(to_uintptr(&Value::CData(cd)).expect("addr"), 0x1000);

        // checked assignment between distinct pointer types fails, but a
        // cast does not care
        let pa = type_of(&mut reg, "struct a*");
        let ipv = cast(&ip, &Value::Int(0x2000), &arena).expect("cast");
        let again = cast(&pa, &Value::CData(ipv), &arena).expect("cast");
        assert_eq!(to_uintptr(&Value::CData(again)).expect("addr"), 0x2000);

        let n = cast(&type_of(&mut reg, "int"), &Value::Float(3.9), &arena).expect("cast");
        assert_eq!(int_value(&get(&n)), 3);
    }

    #[test]
    fn istype_is_nominal() {
        let mut reg = parse("struct a { int x; }; struct b { int x; }; typedef struct a aa;");
        let arena = reg.arena.clone();

        let a = type_of(&mut reg, "struct a");
        let aa = type_of(&mut reg, "aa");
        let b = type_of(&mut reg, "struct b");

        let cd = construct(&a, None, &arena).expect("construct");
        let v = Value::CData(cd);
        assert!(istype(&a, &v));
        assert!(istype(&aa, &v));
        assert!(!istype(&b, &v));
        assert!(!istype(&a, &Value::Int(3)));
    }

    #[test]
    fn pointer_arithmetic_scales_by_the_element() {
        let mut reg = Registry::new();
        let arena = reg.arena.clone();

        let ip = type_of(&mut reg, "int*");
        let p = Value::CData(cast(&ip, &Value::Int(0x1000), &arena).expect("cast"));

        let q = arith(ArithOp::Add, &p, Some(&Value::Int(3)), &arena).expect("add");
        assert_eq!(to_uintptr(&q).expect("addr"), 0x100C);

        let back = arith(ArithOp::Sub, &q, Some(&Value::Int(1)), &arena).expect("sub");
        assert_eq!(to_uintptr(&back).expect("addr"), 0x1008);

        let err = arith(ArithOp::Add, &p, Some(&p), &arena).expect_err("ptr+ptr");
        assert!(matches!(err, MarshalError::PointerArith { .. }));
    }

    #[test]
    fn rank_promotion_boxes_wide_results() {
        let mut reg = Registry::new();
        let arena = reg.arena.clone();

        let wide = Value::CData(
            construct(&type_of(&mut reg, "uint64_t"), Some(&Value::Int(10)), &arena)
                .expect("construct"),
        );
        let out = arith(ArithOp::Add, &Value::Int(2), Some(&wide), &arena).expect("add");
        let Value::CData(cd) = &out else { panic!("expected boxed result") };
        assert_eq!(cd.ctype.kind, TypeKind::U64);
        assert_eq!(int_value(&get(cd)), 12);

        // plain integers stay plain
        let small = arith(ArithOp::Mul, &Value::Int(6), Some(&Value::Int(7)), &arena)
            .expect("mul");
        assert_eq!(int_value(&small), 42);

        let err = arith(ArithOp::Div, &Value::Int(1), Some(&Value::Int(0)), &arena)
            .expect_err("division by zero");
        assert!(matches!(err, MarshalError::DivideByZero));
    }

    #[test]
    fn unsigned_comparison_uses_the_promoted_rank() {
        let mut reg = Registry::new();
        let arena = reg.arena.clone();

        let big = Value::CData(
            construct(&type_of(&mut reg, "uint64_t"), Some(&Value::Int(-1)), &arena)
                .expect("construct"),
        );
        // -1 as uint64_t is the maximum value
        let lt = arith(ArithOp::Lt, &Value::Int(5), Some(&big), &arena).expect("lt");
        assert!(matches!(lt, Value::Bool(true)));
    }

    #[test]
    fn frames_place_arguments_by_slot() {
        let mut reg = Registry::new();
        let arena = reg.arena.clone();

        let ret = type_of(&mut reg, "int");
        let args = [type_of(&mut reg, "int"), type_of(&mut reg, "double"), {
            let mut c = CType::scalar(TypeKind::I8);
            c.pointers = 1;
            c
        }];
        let plan = crate::jit::classify_call(&ret, &args, false, &arena).expect("plan");
        let frame = build_frame(&plan, &ret, &args, &[
            Value::Int(-7),
            Value::Float(2.5),
            Value::Str("hi".to_string()),
        ], &arena)
        .expect("frame");

        assert_eq!(frame.words[0] as u32 as i32, -7);
        assert_eq!(f64::from_bits(frame.words[1]), 2.5);
        let p = frame.words[2] as *const u8;
        assert!(!p.is_null());
        assert_eq!(unsafe { std::slice::from_raw_parts(p, 3) }, b"hi\0");
    }

    #[test]
    fn conversion_failures_name_the_argument() {
        let mut reg = Registry::new();
        let arena = reg.arena.clone();

        let ret = type_of(&mut reg, "int");
        let args = [type_of(&mut reg, "int")];
        let plan = crate::jit::classify_call(&ret, &args, false, &arena).expect("plan");
        let err = build_frame(&plan, &ret, &args, &[Value::Str("x".to_string())], &arena)
            .expect_err("bad arg");
        assert_eq!(
            err.to_string(),
            "unable to convert argument 1 from string to int"
        );
    }

    #[test]
    fn return_registers_narrow_to_the_declared_type() {
        let mut reg = Registry::new();
        let arena = reg.arena.clone();

        let ret = type_of(&mut reg, "int");
        let plan = crate::jit::classify_call(&ret, &[], false, &arena).expect("plan");
        let raw = [0xFFFF_FFFF_FFFF_FFFFu64, 0];
        assert_eq!(int_value(&read_ret(&ret, &plan, &raw, None, &arena)), -1);

        let ret = type_of(&mut reg, "float");
        let plan = crate::jit::classify_call(&ret, &[], false, &arena).expect("plan");
        let raw = [1.5f32.to_bits() as u64, 0];
        assert!(matches!(
            read_ret(&ret, &plan, &raw, None, &arena),
            Value::Float(f) if f == 1.5
        ));
    }

    #[test]
    fn vararg_promotion_follows_c_rules() {
        let mut reg = Registry::new();
        let arena = reg.arena.clone();

        assert_eq!(
            promote_vararg(&Value::Float(1.0), &arena).expect("float").kind,
            TypeKind::Double
        );
        assert_eq!(
            promote_vararg(&Value::Int(1), &arena).expect("int").kind,
            TypeKind::I64
        );
        let s = promote_vararg(&"x".into(), &arena).expect("str");
        assert!(s.kind.is_char() && s.ptr_depth() == 1);

        let f = Value::CData(
            construct(&type_of(&mut reg, "float"), Some(&Value::Float(2.0)), &arena)
                .expect("construct"),
        );
        assert_eq!(promote_vararg(&f, &arena).expect("cdata float").kind, TypeKind::Double);
    }
}
