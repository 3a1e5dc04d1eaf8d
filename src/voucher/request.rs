//! Client requests accepted by the engine

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::*;

/// A row to be created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRow {
    pub payload: RowPayload,
    /// Upstream row this line is generated from, with the token the client saw
    pub source: Option<SourceLink>,
    /// Files to attach to the new row
    pub files: Vec<Uuid>,
}

impl NewRow {
    pub fn new(payload: RowPayload) -> Self {
        Self {
            payload,
            source: None,
            files: Vec::new(),
        }
    }

    pub fn linked(payload: RowPayload, source: SourceLink) -> Self {
        Self {
            payload,
            source: Some(source),
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, file_id: Uuid) -> Self {
        self.files.push(file_id);
        self
    }
}

/// Add request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVoucher {
    pub kind: VoucherKind,
    pub business_date: NaiveDate,
    pub description: String,
    pub department_id: Uuid,
    pub rows: Vec<NewRow>,
}

/// One row-level change inside an Edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowEdit {
    Add(NewRow),
    Update {
        row_id: Uuid,
        token: ConcurrencyToken,
        payload: RowPayload,
    },
    Remove {
        row_id: Uuid,
        token: ConcurrencyToken,
    },
}

/// Edit request; header fields left `None` keep their stored value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditVoucher {
    pub header_id: Uuid,
    pub token: ConcurrencyToken,
    pub business_date: Option<NaiveDate>,
    pub description: Option<String>,
    pub department_id: Option<Uuid>,
    pub rows: Vec<RowEdit>,
}

impl EditVoucher {
    pub fn new(header_id: Uuid, token: ConcurrencyToken) -> Self {
        Self {
            header_id,
            token,
            business_date: None,
            description: None,
            department_id: None,
            rows: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn business_date(mut self, date: NaiveDate) -> Self {
        self.business_date = Some(date);
        self
    }

    pub fn department(mut self, department_id: Uuid) -> Self {
        self.department_id = Some(department_id);
        self
    }

    pub fn add_row(mut self, row: NewRow) -> Self {
        self.rows.push(RowEdit::Add(row));
        self
    }

    pub fn update_row(mut self, row_id: Uuid, token: ConcurrencyToken, payload: RowPayload) -> Self {
        self.rows.push(RowEdit::Update {
            row_id,
            token,
            payload,
        });
        self
    }

    pub fn remove_row(mut self, row_id: Uuid, token: ConcurrencyToken) -> Self {
        self.rows.push(RowEdit::Remove { row_id, token });
        self
    }
}

/// Builder for Add requests
#[derive(Debug)]
pub struct VoucherBuilder {
    request: NewVoucher,
}

impl VoucherBuilder {
    pub fn new(
        kind: VoucherKind,
        business_date: NaiveDate,
        description: impl Into<String>,
        department_id: Uuid,
    ) -> Self {
        Self {
            request: NewVoucher {
                kind,
                business_date,
                description: description.into(),
                department_id,
                rows: Vec::new(),
            },
        }
    }

    /// Add an unlinked row
    pub fn row(mut self, payload: RowPayload) -> Self {
        self.request.rows.push(NewRow::new(payload));
        self
    }

    /// Add a row generated from an upstream row
    pub fn linked_row(mut self, payload: RowPayload, source: SourceLink) -> Self {
        self.request.rows.push(NewRow::linked(payload, source));
        self
    }

    /// Add a fully specified row
    pub fn new_row(mut self, row: NewRow) -> Self {
        self.request.rows.push(row);
        self
    }

    pub fn build(self) -> NewVoucher {
        self.request
    }
}
