// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! Realization of the schema-provider collaborator: everything the engine
//! needs to know about a table to serialize and compare its rows.

use std::sync::Arc;

use itertools::Itertools;

use crate::value::ColumnType;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    pub fn is_atomic(&self) -> bool {
        !self.ty.is_multi_cell()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Static,
    Regular,
}

/// Compression requested for the data file. `None` disables compression
/// and enables the standalone CRC component instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressionParams {
    pub name: String,
    pub chunk_length: u32,
    pub options: Vec<(String, String)>,
}

impl CompressionParams {
    pub fn lz4() -> Self {
        Self {
            name: "LZ4Compressor".into(),
            chunk_length: 64 * 1024,
            options: vec![],
        }
    }
}

#[derive(Debug)]
pub struct Schema {
    pub keyspace: String,
    pub table: String,
    pub partition_key: Vec<ColumnDef>,
    pub clustering: Vec<ColumnDef>,
    statics: Vec<ColumnDef>,
    regulars: Vec<ColumnDef>,
    /// Column emission order: atomic columns first, then multi-cell ones,
    /// each group in schema order. Values are indices into the column list
    /// of the kind.
    static_layout: Vec<usize>,
    regular_layout: Vec<usize>,
    pub is_compound: bool,
    pub is_dense: bool,
    pub min_index_interval: u32,
    pub bloom_filter_fp_chance: f64,
    pub compression: Option<CompressionParams>,
}

impl Schema {
    pub fn builder(keyspace: impl Into<String>, table: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            keyspace: keyspace.into(),
            table: table.into(),
            partition_key: vec![],
            clustering: vec![],
            statics: vec![],
            regulars: vec![],
            is_dense: false,
            min_index_interval: 128,
            bloom_filter_fp_chance: 0.01,
            compression: None,
        }
    }

    pub fn columns(&self, kind: ColumnKind) -> &[ColumnDef] {
        match kind {
            ColumnKind::Static => &self.statics,
            ColumnKind::Regular => &self.regulars,
        }
    }

    /// Atomic-first emission order for the given kind.
    pub fn layout(&self, kind: ColumnKind) -> &[usize] {
        match kind {
            ColumnKind::Static => &self.static_layout,
            ColumnKind::Regular => &self.regular_layout,
        }
    }

    pub fn column(&self, kind: ColumnKind, index: usize) -> &ColumnDef {
        &self.columns(kind)[index]
    }

    pub fn has_statics(&self) -> bool {
        !self.statics.is_empty()
    }

    /// The partition-key type name recorded in the serialization header;
    /// composite keys nest their component types.
    pub fn pk_type_name(&self) -> String {
        if self.partition_key.len() == 1 {
            self.partition_key[0].ty.marshal_name()
        } else {
            let inner = self
                .partition_key
                .iter()
                .map(|c| c.ty.marshal_name())
                .join(",");
            format!("org.apache.cassandra.db.marshal.CompositeType({inner})")
        }
    }
}

pub struct SchemaBuilder {
    keyspace: String,
    table: String,
    partition_key: Vec<ColumnDef>,
    clustering: Vec<ColumnDef>,
    statics: Vec<ColumnDef>,
    regulars: Vec<ColumnDef>,
    is_dense: bool,
    min_index_interval: u32,
    bloom_filter_fp_chance: f64,
    compression: Option<CompressionParams>,
}

impl SchemaBuilder {
    pub fn partition_key(mut self, name: &str, ty: ColumnType) -> Self {
        self.partition_key.push(ColumnDef::new(name, ty));
        self
    }

    pub fn clustering(mut self, name: &str, ty: ColumnType) -> Self {
        self.clustering.push(ColumnDef::new(name, ty));
        self
    }

    pub fn static_column(mut self, name: &str, ty: ColumnType) -> Self {
        self.statics.push(ColumnDef::new(name, ty));
        self
    }

    pub fn regular(mut self, name: &str, ty: ColumnType) -> Self {
        self.regulars.push(ColumnDef::new(name, ty));
        self
    }

    pub fn dense(mut self) -> Self {
        self.is_dense = true;
        self
    }

    pub fn min_index_interval(mut self, interval: u32) -> Self {
        self.min_index_interval = interval;
        self
    }

    pub fn bloom_filter_fp_chance(mut self, chance: f64) -> Self {
        self.bloom_filter_fp_chance = chance;
        self
    }

    pub fn compression(mut self, params: CompressionParams) -> Self {
        self.compression = Some(params);
        self
    }

    pub fn build(self) -> Arc<Schema> {
        assert!(!self.partition_key.is_empty(), "partition key required");
        let layout_of = |columns: &[ColumnDef]| {
            let (atomic, complex): (Vec<_>, Vec<_>) =
                (0..columns.len()).partition(|i| columns[*i].is_atomic());
            atomic.into_iter().chain(complex).collect_vec()
        };
        Arc::new(Schema {
            static_layout: layout_of(&self.statics),
            regular_layout: layout_of(&self.regulars),
            keyspace: self.keyspace,
            table: self.table,
            partition_key: self.partition_key,
            clustering: self.clustering,
            statics: self.statics,
            regulars: self.regulars,
            is_compound: true,
            is_dense: self.is_dense,
            min_index_interval: self.min_index_interval,
            bloom_filter_fp_chance: self.bloom_filter_fp_chance,
            compression: self.compression,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_puts_atomic_columns_first() {
        let schema = Schema::builder("ks", "cf")
            .partition_key("pk", ColumnType::Int)
            .regular("a", ColumnType::List(Box::new(ColumnType::Text)))
            .regular("b", ColumnType::Int)
            .regular("c", ColumnType::Set(Box::new(ColumnType::Int)))
            .regular("d", ColumnType::Text)
            .build();
        assert_eq!(schema.layout(ColumnKind::Regular), &[1, 3, 0, 2]);
    }

    #[test]
    fn composite_pk_type_name() {
        let schema = Schema::builder("ks", "cf")
            .partition_key("a", ColumnType::Int)
            .partition_key("b", ColumnType::Text)
            .regular("v", ColumnType::Int)
            .build();
        assert!(schema.pk_type_name().starts_with(
            "org.apache.cassandra.db.marshal.CompositeType(",
        ));
    }
}
