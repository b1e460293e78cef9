//! Database service for invoicing-engine.
//!
//! Persistence boundary for the pure engine: every mutating operation reads
//! the current rows, runs the relevant `engine` function on plain values, and
//! writes the result back inside one transaction. Invoice rows are locked
//! with `FOR UPDATE NOWAIT`; a lost lock race surfaces as a retryable
//! conflict instead of a stale read.

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::Transaction;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::engine::{self, DocumentType, EngineError, LineComputation, TransitionContext};
use crate::models::{
    CreateInvoice, CreatePayment, Invoice, InvoiceStatus, LineItem, LineItemDraft,
    ListInvoicesFilter, Payment, PaymentStatus, UpdateInvoice, UpdateLineItem,
};
use crate::services::metrics::{
    DB_QUERY_DURATION, ERRORS_TOTAL, INVOICES_TOTAL, INVOICE_AMOUNT_TOTAL, PAYMENTS_TOTAL,
    PAYMENT_AMOUNT_TOTAL,
};
use crate::services::sequence::Sequencer;

const INVOICE_COLUMNS: &str = "invoice_id, business_id, client_id, invoice_number, status, \
    invoice_date, due_date, payment_terms, custom_due_days, currency, subtotal, discount_type, \
    discount_value, discount_amount, tax_amount, shipping_amount, total_amount, amount_paid, \
    amount_due, notes, sent_at, viewed_at, paid_at, cancelled_at, created_utc, updated_utc";

const LINE_ITEM_COLUMNS: &str = "line_item_id, invoice_id, business_id, description, quantity, \
    unit_price, tax_rate, discount_type, discount_value, discount_amount, tax_amount, line_total, \
    sort_order, created_utc";

const PAYMENT_COLUMNS: &str = "payment_id, invoice_id, business_id, payment_number, payment_date, \
    amount, payment_method, status, transaction_id, reference_number, notes, created_utc, \
    updated_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

fn map_sqlx_err(context: &str, e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(ref db_err) = e {
        // lock_not_available from FOR UPDATE NOWAIT: safe to retry whole op.
        if db_err.code().as_deref() == Some("55P03") {
            return EngineError::ConcurrencyConflict.into();
        }
    }
    ERRORS_TOTAL.with_label_values(&["db_error"]).inc();
    AppError::DatabaseError(anyhow::anyhow!("{context}: {e}"))
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "invoicing-engine"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Invoice Operations
    // -------------------------------------------------------------------------

    /// Create a draft invoice with its line items, computing all monetary
    /// fields through the engine and drawing a number from the sequencer.
    #[instrument(skip(self, sequencer, input), fields(business_id = %input.business_id))]
    pub async fn create_invoice(
        &self,
        sequencer: &dyn Sequencer,
        input: &CreateInvoice,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let computations: Vec<LineComputation> = input
            .items
            .iter()
            .map(engine::compute_line_item)
            .collect::<Result<_, EngineError>>()?;

        let discount = input.discount_type.map(|dt| (dt, input.discount_value));
        let totals =
            engine::compute_invoice_totals(&computations, discount, input.shipping_amount)?;

        let due_date = input.due_date.unwrap_or_else(|| {
            input
                .payment_terms
                .due_date_from(input.invoice_date, input.custom_due_days)
        });

        let invoice_number = sequencer
            .next_number(input.business_id, DocumentType::Invoice)
            .await?;

        let invoice_id = Uuid::new_v4();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("Failed to begin transaction", e))?;

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (
                invoice_id, business_id, client_id, invoice_number, status, invoice_date,
                due_date, payment_terms, custom_due_days, currency, subtotal, discount_type,
                discount_value, discount_amount, tax_amount, shipping_amount, total_amount,
                amount_paid, amount_due, notes
            )
            VALUES ($1, $2, $3, $4, 'draft', $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, 0, $16, $17)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(invoice_id)
        .bind(input.business_id)
        .bind(input.client_id)
        .bind(&invoice_number)
        .bind(input.invoice_date)
        .bind(due_date)
        .bind(input.payment_terms)
        .bind(input.custom_due_days)
        .bind(&input.currency)
        .bind(totals.subtotal)
        .bind(input.discount_type)
        .bind(input.discount_value)
        .bind(totals.discount_amount)
        .bind(totals.tax_amount)
        .bind(totals.shipping_amount)
        .bind(totals.total_amount)
        .bind(&input.notes)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Invoice number {} already exists for this business",
                    invoice_number
                ))
            }
            _ => map_sqlx_err("Failed to create invoice", e),
        })?;

        for (draft, computed) in input.items.iter().zip(&computations) {
            insert_line_item(&mut tx, &invoice, draft, computed).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("Failed to commit invoice creation", e))?;

        INVOICES_TOTAL.with_label_values(&["draft"]).inc();
        timer.observe_duration();

        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            total_amount = %invoice.total_amount,
            "Draft invoice created"
        );

        Ok(invoice)
    }

    /// Get an invoice by ID, with overdue derived from today's date.
    #[instrument(skip(self), fields(business_id = %business_id, invoice_id = %invoice_id))]
    pub async fn get_invoice(
        &self,
        business_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE business_id = $1 AND invoice_id = $2"
        ))
        .bind(business_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("Failed to get invoice", e))?;

        timer.observe_duration();

        Ok(invoice.map(present))
    }

    /// List invoices for a business.
    #[instrument(skip(self, filter), fields(business_id = %business_id))]
    pub async fn list_invoices(
        &self,
        business_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;

        let invoices = if let Some(cursor) = filter.page_token {
            sqlx::query_as::<_, Invoice>(&format!(
                r#"
                SELECT {INVOICE_COLUMNS}
                FROM invoices
                WHERE business_id = $1
                  AND ($2::invoice_status IS NULL OR status = $2)
                  AND ($3::uuid IS NULL OR client_id = $3)
                  AND ($4::date IS NULL OR invoice_date >= $4)
                  AND ($5::date IS NULL OR invoice_date <= $5)
                  AND invoice_id > $6
                ORDER BY invoice_id
                LIMIT $7
                "#
            ))
            .bind(business_id)
            .bind(filter.status)
            .bind(filter.client_id)
            .bind(filter.start_date)
            .bind(filter.end_date)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Invoice>(&format!(
                r#"
                SELECT {INVOICE_COLUMNS}
                FROM invoices
                WHERE business_id = $1
                  AND ($2::invoice_status IS NULL OR status = $2)
                  AND ($3::uuid IS NULL OR client_id = $3)
                  AND ($4::date IS NULL OR invoice_date >= $4)
                  AND ($5::date IS NULL OR invoice_date <= $5)
                ORDER BY invoice_id
                LIMIT $6
                "#
            ))
            .bind(business_id)
            .bind(filter.status)
            .bind(filter.client_id)
            .bind(filter.start_date)
            .bind(filter.end_date)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| map_sqlx_err("Failed to list invoices", e))?;

        timer.observe_duration();

        Ok(invoices.into_iter().map(present).collect())
    }

    /// Update a draft invoice's terms, discount or shipping, recomputing
    /// totals. Non-draft invoices are locked.
    #[instrument(skip(self, input), fields(business_id = %business_id, invoice_id = %invoice_id))]
    pub async fn update_invoice(
        &self,
        business_id: Uuid,
        invoice_id: Uuid,
        input: &UpdateInvoice,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("Failed to begin transaction", e))?;

        let Some(invoice) = lock_invoice(&mut tx, business_id, invoice_id).await? else {
            return Ok(None);
        };
        require_draft(&invoice)?;

        let discount_type = input.discount_type.or(invoice.discount_type);
        let discount_value = input.discount_value.unwrap_or(invoice.discount_value);
        let shipping_amount = input.shipping_amount.unwrap_or(invoice.shipping_amount);
        let due_date = input.due_date.unwrap_or(invoice.due_date);

        sqlx::query(
            r#"
            UPDATE invoices
            SET due_date = $3,
                discount_type = $4,
                discount_value = $5,
                shipping_amount = $6,
                notes = COALESCE($7, notes),
                updated_utc = NOW()
            WHERE business_id = $1 AND invoice_id = $2
            "#,
        )
        .bind(business_id)
        .bind(invoice_id)
        .bind(due_date)
        .bind(discount_type)
        .bind(discount_value)
        .bind(shipping_amount)
        .bind(&input.notes)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("Failed to update invoice", e))?;

        let invoice = recalculate_totals(&mut tx, business_id, invoice_id).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("Failed to commit invoice update", e))?;

        timer.observe_duration();

        info!(invoice_id = %invoice.invoice_id, "Invoice updated");

        Ok(Some(invoice))
    }

    /// Delete a draft invoice. Invoices with payments are never physically
    /// deleted; they are retired through cancellation instead.
    #[instrument(skip(self), fields(business_id = %business_id, invoice_id = %invoice_id))]
    pub async fn delete_invoice(
        &self,
        business_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_invoice"])
            .start_timer();

        let result = sqlx::query(
            "DELETE FROM invoices WHERE business_id = $1 AND invoice_id = $2 AND status = 'draft'",
        )
        .bind(business_id)
        .bind(invoice_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("Failed to delete invoice", e))?;

        timer.observe_duration();

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(invoice_id = %invoice_id, "Draft invoice deleted");
        }

        Ok(deleted)
    }

    /// Request a lifecycle transition (send, mark viewed, cancel).
    #[instrument(skip(self), fields(business_id = %business_id, invoice_id = %invoice_id, target = %target))]
    pub async fn transition_invoice(
        &self,
        business_id: Uuid,
        invoice_id: Uuid,
        target: InvoiceStatus,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition_invoice"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("Failed to begin transaction", e))?;

        let Some(invoice) = lock_invoice(&mut tx, business_id, invoice_id).await? else {
            return Ok(None);
        };

        let line_item_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM line_items WHERE business_id = $1 AND invoice_id = $2",
        )
        .bind(business_id)
        .bind(invoice_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("Failed to count line items", e))?;

        let ctx = TransitionContext {
            line_item_count: line_item_count as usize,
            has_completed_payment: has_completed_payment(&mut tx, business_id, invoice_id).await?,
            now: Utc::now(),
        };

        let updated = engine::transition(&invoice, target, &ctx)?;
        let updated = write_invoice_state(&mut tx, &updated).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("Failed to commit transition", e))?;

        INVOICES_TOTAL
            .with_label_values(&[updated.status.as_str()])
            .inc();
        if updated.status == InvoiceStatus::Sent {
            if let Some(amount) = updated.total_amount.to_f64() {
                INVOICE_AMOUNT_TOTAL
                    .with_label_values(&[&updated.currency])
                    .inc_by(amount);
            }
        }
        timer.observe_duration();

        info!(
            invoice_id = %updated.invoice_id,
            status = %updated.status,
            "Invoice transitioned"
        );

        Ok(Some(updated))
    }

    // -------------------------------------------------------------------------
    // Line Item Operations
    // -------------------------------------------------------------------------

    /// Add a line item to a draft invoice and recompute totals.
    #[instrument(skip(self, draft), fields(business_id = %business_id, invoice_id = %invoice_id))]
    pub async fn add_line_item(
        &self,
        business_id: Uuid,
        invoice_id: Uuid,
        draft: &LineItemDraft,
    ) -> Result<LineItem, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_line_item"])
            .start_timer();

        let computed = engine::compute_line_item(draft)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("Failed to begin transaction", e))?;

        let invoice = lock_invoice(&mut tx, business_id, invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
        require_draft(&invoice)?;

        let line_item = insert_line_item(&mut tx, &invoice, draft, &computed).await?;
        recalculate_totals(&mut tx, business_id, invoice_id).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("Failed to commit line item", e))?;

        timer.observe_duration();

        info!(line_item_id = %line_item.line_item_id, "Line item added");

        Ok(line_item)
    }

    /// Update a line item on a draft invoice and recompute totals. Unset
    /// fields keep their current values.
    #[instrument(skip(self, input), fields(business_id = %business_id, line_item_id = %line_item_id))]
    pub async fn update_line_item(
        &self,
        business_id: Uuid,
        invoice_id: Uuid,
        line_item_id: Uuid,
        input: &UpdateLineItem,
    ) -> Result<Option<LineItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_line_item"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("Failed to begin transaction", e))?;

        let Some(invoice) = lock_invoice(&mut tx, business_id, invoice_id).await? else {
            return Ok(None);
        };
        require_draft(&invoice)?;

        let existing = sqlx::query_as::<_, LineItem>(&format!(
            r#"
            SELECT {LINE_ITEM_COLUMNS}
            FROM line_items
            WHERE business_id = $1 AND invoice_id = $2 AND line_item_id = $3
            "#
        ))
        .bind(business_id)
        .bind(invoice_id)
        .bind(line_item_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("Failed to get line item", e))?;

        let Some(existing) = existing else {
            return Ok(None);
        };

        let draft = LineItemDraft {
            description: input
                .description
                .clone()
                .unwrap_or_else(|| existing.description.clone()),
            quantity: input.quantity.unwrap_or(existing.quantity),
            unit_price: input.unit_price.unwrap_or(existing.unit_price),
            tax_rate: input.tax_rate.unwrap_or(existing.tax_rate),
            discount_type: input.discount_type.or(existing.discount_type),
            discount_value: input.discount_value.unwrap_or(existing.discount_value),
            sort_order: input.sort_order.unwrap_or(existing.sort_order),
        };
        let computed = engine::compute_line_item(&draft)?;

        let line_item = sqlx::query_as::<_, LineItem>(&format!(
            r#"
            UPDATE line_items
            SET description = $4,
                quantity = $5,
                unit_price = $6,
                tax_rate = $7,
                discount_type = $8,
                discount_value = $9,
                discount_amount = $10,
                tax_amount = $11,
                line_total = $12,
                sort_order = $13
            WHERE business_id = $1 AND invoice_id = $2 AND line_item_id = $3
            RETURNING {LINE_ITEM_COLUMNS}
            "#
        ))
        .bind(business_id)
        .bind(invoice_id)
        .bind(line_item_id)
        .bind(&draft.description)
        .bind(draft.quantity)
        .bind(draft.unit_price)
        .bind(draft.tax_rate)
        .bind(draft.discount_type)
        .bind(draft.discount_value)
        .bind(computed.discount_amount)
        .bind(computed.tax_amount)
        .bind(computed.total)
        .bind(draft.sort_order)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("Failed to update line item", e))?;

        recalculate_totals(&mut tx, business_id, invoice_id).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("Failed to commit line item update", e))?;

        timer.observe_duration();

        Ok(Some(line_item))
    }

    /// Remove a line item from a draft invoice and recompute totals.
    #[instrument(skip(self), fields(business_id = %business_id, line_item_id = %line_item_id))]
    pub async fn remove_line_item(
        &self,
        business_id: Uuid,
        invoice_id: Uuid,
        line_item_id: Uuid,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["remove_line_item"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("Failed to begin transaction", e))?;

        let Some(invoice) = lock_invoice(&mut tx, business_id, invoice_id).await? else {
            return Ok(false);
        };
        require_draft(&invoice)?;

        let result = sqlx::query(
            "DELETE FROM line_items WHERE business_id = $1 AND invoice_id = $2 AND line_item_id = $3",
        )
        .bind(business_id)
        .bind(invoice_id)
        .bind(line_item_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("Failed to remove line item", e))?;

        let removed = result.rows_affected() > 0;
        if removed {
            recalculate_totals(&mut tx, business_id, invoice_id).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("Failed to commit line item removal", e))?;

        timer.observe_duration();

        Ok(removed)
    }

    /// Get line items for an invoice in display order.
    #[instrument(skip(self), fields(business_id = %business_id, invoice_id = %invoice_id))]
    pub async fn get_line_items(
        &self,
        business_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<LineItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_line_items"])
            .start_timer();

        let line_items = sqlx::query_as::<_, LineItem>(&format!(
            r#"
            SELECT {LINE_ITEM_COLUMNS}
            FROM line_items
            WHERE business_id = $1 AND invoice_id = $2
            ORDER BY sort_order, created_utc
            "#
        ))
        .bind(business_id)
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("Failed to get line items", e))?;

        timer.observe_duration();

        Ok(line_items)
    }

    // -------------------------------------------------------------------------
    // Payment Operations
    // -------------------------------------------------------------------------

    /// Record a completed payment and reconcile it against the invoice.
    #[instrument(skip(self, sequencer, input), fields(business_id = %input.business_id, invoice_id = %input.invoice_id))]
    pub async fn record_payment(
        &self,
        sequencer: &dyn Sequencer,
        input: &CreatePayment,
    ) -> Result<(Invoice, Payment), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_payment"])
            .start_timer();

        let payment_number = sequencer
            .next_number(input.business_id, DocumentType::Payment)
            .await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("Failed to begin transaction", e))?;

        let invoice = lock_invoice(&mut tx, input.business_id, input.invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

        let now = Utc::now();
        let payment = Payment {
            payment_id: Uuid::new_v4(),
            invoice_id: input.invoice_id,
            business_id: input.business_id,
            payment_number,
            payment_date: input.payment_date,
            amount: input.amount,
            payment_method: input.payment_method,
            status: PaymentStatus::Completed,
            transaction_id: input.transaction_id.clone(),
            reference_number: input.reference_number.clone(),
            notes: input.notes.clone(),
            created_utc: now,
            updated_utc: now,
        };

        let (updated_invoice, payment) = engine::apply_payment(&invoice, &payment, now)?;

        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments (
                payment_id, invoice_id, business_id, payment_number, payment_date, amount,
                payment_method, status, transaction_id, reference_number, notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment.payment_id)
        .bind(payment.invoice_id)
        .bind(payment.business_id)
        .bind(&payment.payment_number)
        .bind(payment.payment_date)
        .bind(payment.amount)
        .bind(payment.payment_method)
        .bind(payment.status)
        .bind(&payment.transaction_id)
        .bind(&payment.reference_number)
        .bind(&payment.notes)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Payment number {} already exists for this business",
                    payment.payment_number
                ))
            }
            _ => map_sqlx_err("Failed to record payment", e),
        })?;

        let updated_invoice = write_invoice_state(&mut tx, &updated_invoice).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("Failed to commit payment", e))?;

        PAYMENTS_TOTAL
            .with_label_values(&[payment.payment_method.as_str()])
            .inc();
        if let Some(amount) = payment.amount.to_f64() {
            PAYMENT_AMOUNT_TOTAL
                .with_label_values(&[&updated_invoice.currency])
                .inc_by(amount);
        }
        timer.observe_duration();

        info!(
            payment_id = %payment.payment_id,
            payment_number = %payment.payment_number,
            amount = %payment.amount,
            invoice_status = %updated_invoice.status,
            "Payment recorded"
        );

        Ok((updated_invoice, payment))
    }

    /// Refund a completed payment and reconcile the invoice balance.
    #[instrument(skip(self), fields(business_id = %business_id, payment_id = %payment_id))]
    pub async fn refund_payment(
        &self,
        business_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<(Invoice, Payment)>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["refund_payment"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("Failed to begin transaction", e))?;

        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE business_id = $1 AND payment_id = $2"
        ))
        .bind(business_id)
        .bind(payment_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("Failed to get payment", e))?;

        let Some(payment) = payment else {
            return Ok(None);
        };

        let invoice = lock_invoice(&mut tx, business_id, payment.invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

        let now = Utc::now();
        let (updated_invoice, refunded) = engine::refund_payment(&invoice, &payment, now)?;

        sqlx::query(
            r#"
            UPDATE payments
            SET status = $3, updated_utc = $4
            WHERE business_id = $1 AND payment_id = $2
            "#,
        )
        .bind(business_id)
        .bind(payment_id)
        .bind(refunded.status)
        .bind(refunded.updated_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("Failed to update payment", e))?;

        let updated_invoice = write_invoice_state(&mut tx, &updated_invoice).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("Failed to commit refund", e))?;

        timer.observe_duration();

        info!(
            payment_id = %refunded.payment_id,
            amount = %refunded.amount,
            invoice_status = %updated_invoice.status,
            "Payment refunded"
        );

        Ok(Some((updated_invoice, refunded)))
    }

    /// Get a payment by ID.
    #[instrument(skip(self), fields(business_id = %business_id, payment_id = %payment_id))]
    pub async fn get_payment(
        &self,
        business_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE business_id = $1 AND payment_id = $2"
        ))
        .bind(business_id)
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("Failed to get payment", e))?;

        timer.observe_duration();

        Ok(payment)
    }

    /// List payments recorded against an invoice.
    #[instrument(skip(self), fields(business_id = %business_id, invoice_id = %invoice_id))]
    pub async fn list_payments(
        &self,
        business_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments"])
            .start_timer();

        let payments = sqlx::query_as::<_, Payment>(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM payments
            WHERE business_id = $1 AND invoice_id = $2
            ORDER BY payment_date, payment_number
            "#
        ))
        .bind(business_id)
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("Failed to list payments", e))?;

        timer.observe_duration();

        Ok(payments)
    }
}

/// Overdue is presented on read, never stored.
fn present(invoice: Invoice) -> Invoice {
    let today = Utc::now().date_naive();
    let status = engine::effective_status(&invoice, today);
    Invoice { status, ..invoice }
}

fn require_draft(invoice: &Invoice) -> Result<(), EngineError> {
    if invoice.status != InvoiceStatus::Draft {
        return Err(EngineError::InvoiceLocked(invoice.invoice_id));
    }
    Ok(())
}

/// Lock the invoice row for the rest of the transaction. NOWAIT keeps the
/// suspension bounded; a held lock comes back as `ConcurrencyConflict`.
async fn lock_invoice(
    tx: &mut Transaction<'_, Postgres>,
    business_id: Uuid,
    invoice_id: Uuid,
) -> Result<Option<Invoice>, AppError> {
    sqlx::query_as::<_, Invoice>(&format!(
        r#"
        SELECT {INVOICE_COLUMNS}
        FROM invoices
        WHERE business_id = $1 AND invoice_id = $2
        FOR UPDATE NOWAIT
        "#
    ))
    .bind(business_id)
    .bind(invoice_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_err("Failed to lock invoice", e))
}

async fn has_completed_payment(
    tx: &mut Transaction<'_, Postgres>,
    business_id: Uuid,
    invoice_id: Uuid,
) -> Result<bool, AppError> {
    sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM payments
            WHERE business_id = $1 AND invoice_id = $2 AND status = 'completed'
        )
        "#,
    )
    .bind(business_id)
    .bind(invoice_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_err("Failed to check payments", e))
}

async fn insert_line_item(
    tx: &mut Transaction<'_, Postgres>,
    invoice: &Invoice,
    draft: &LineItemDraft,
    computed: &LineComputation,
) -> Result<LineItem, AppError> {
    sqlx::query_as::<_, LineItem>(&format!(
        r#"
        INSERT INTO line_items (
            line_item_id, invoice_id, business_id, description, quantity, unit_price,
            tax_rate, discount_type, discount_value, discount_amount, tax_amount,
            line_total, sort_order
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING {LINE_ITEM_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(invoice.invoice_id)
    .bind(invoice.business_id)
    .bind(&draft.description)
    .bind(draft.quantity)
    .bind(draft.unit_price)
    .bind(draft.tax_rate)
    .bind(draft.discount_type)
    .bind(draft.discount_value)
    .bind(computed.discount_amount)
    .bind(computed.tax_amount)
    .bind(computed.total)
    .bind(draft.sort_order)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_err("Failed to insert line item", e))
}

/// Recompute invoice totals from its current line items. The invoice row
/// must already be locked and in draft status.
async fn recalculate_totals(
    tx: &mut Transaction<'_, Postgres>,
    business_id: Uuid,
    invoice_id: Uuid,
) -> Result<Invoice, AppError> {
    let items = sqlx::query_as::<_, LineItem>(&format!(
        r#"
        SELECT {LINE_ITEM_COLUMNS}
        FROM line_items
        WHERE business_id = $1 AND invoice_id = $2
        ORDER BY sort_order, created_utc
        "#
    ))
    .bind(business_id)
    .bind(invoice_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_err("Failed to load line items", e))?;

    let computations: Vec<LineComputation> = items
        .iter()
        .map(|item| {
            engine::compute_line_item(&LineItemDraft {
                description: item.description.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                tax_rate: item.tax_rate,
                discount_type: item.discount_type,
                discount_value: item.discount_value,
                sort_order: item.sort_order,
            })
        })
        .collect::<Result<_, EngineError>>()?;

    let invoice = sqlx::query_as::<_, Invoice>(&format!(
        "SELECT {INVOICE_COLUMNS} FROM invoices WHERE business_id = $1 AND invoice_id = $2"
    ))
    .bind(business_id)
    .bind(invoice_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_err("Failed to reload invoice", e))?;

    let discount = invoice.discount_type.map(|dt| (dt, invoice.discount_value));
    let totals =
        engine::compute_invoice_totals(&computations, discount, invoice.shipping_amount)?;

    sqlx::query_as::<_, Invoice>(&format!(
        r#"
        UPDATE invoices
        SET subtotal = $3,
            discount_amount = $4,
            tax_amount = $5,
            shipping_amount = $6,
            total_amount = $7,
            amount_due = $7 - amount_paid,
            updated_utc = NOW()
        WHERE business_id = $1 AND invoice_id = $2
        RETURNING {INVOICE_COLUMNS}
        "#
    ))
    .bind(business_id)
    .bind(invoice_id)
    .bind(totals.subtotal)
    .bind(totals.discount_amount)
    .bind(totals.tax_amount)
    .bind(totals.shipping_amount)
    .bind(totals.total_amount)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_err("Failed to write invoice totals", e))
}

/// Persist status, balances and lifecycle timestamps computed by the engine.
async fn write_invoice_state(
    tx: &mut Transaction<'_, Postgres>,
    invoice: &Invoice,
) -> Result<Invoice, AppError> {
    sqlx::query_as::<_, Invoice>(&format!(
        r#"
        UPDATE invoices
        SET status = $3,
            amount_paid = $4,
            amount_due = $5,
            sent_at = $6,
            viewed_at = $7,
            paid_at = $8,
            cancelled_at = $9,
            updated_utc = $10
        WHERE business_id = $1 AND invoice_id = $2
        RETURNING {INVOICE_COLUMNS}
        "#
    ))
    .bind(invoice.business_id)
    .bind(invoice.invoice_id)
    .bind(invoice.status)
    .bind(invoice.amount_paid)
    .bind(invoice.amount_due)
    .bind(invoice.sent_at)
    .bind(invoice.viewed_at)
    .bind(invoice.paid_at)
    .bind(invoice.cancelled_at)
    .bind(invoice.updated_utc)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_err("Failed to write invoice state", e))
}
