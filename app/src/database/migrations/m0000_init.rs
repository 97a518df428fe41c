use super::{Migration, SimpleSqlMigration};

pub fn migration() -> impl Migration {
    SimpleSqlMigration {
        serial_number: 0,
        sql: vec![
            r#"
            CREATE TABLE users (
                id UUID PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                created TIMESTAMP WITH TIME ZONE NOT NULL
            )"#,
            r#"CREATE INDEX user_username ON users (username)"#,
            r#"
            CREATE TABLE profiles (
                user_id UUID PRIMARY KEY REFERENCES users,
                total_ratings BIGINT NOT NULL,
                latest_ratings INT[] NOT NULL,
                avg_rating DOUBLE PRECISION,
                penalty_expiration TIMESTAMP WITH TIME ZONE
            )"#,
            r#"
            CREATE TABLE ln_payments (
                id UUID PRIMARY KEY,
                concept INT NOT NULL,
                kind INT NOT NULL,
                status INT NOT NULL,
                sender_id UUID NOT NULL REFERENCES users,
                receiver_id UUID NOT NULL REFERENCES users,
                invoice TEXT NOT NULL,
                payment_hash TEXT NOT NULL,
                preimage TEXT,
                amount_sats BIGINT NOT NULL,
                description TEXT NOT NULL,
                created TIMESTAMP WITH TIME ZONE NOT NULL,
                expiration TIMESTAMP WITH TIME ZONE NOT NULL
            )"#,
            r#"CREATE INDEX ln_payment_hash ON ln_payments (payment_hash)"#,
            r#"CREATE INDEX ln_payment_status ON ln_payments (status)"#,
            r#"
            CREATE TABLE orders (
                id UUID PRIMARY KEY,
                order_type INT NOT NULL,
                currency TEXT NOT NULL,
                amount NUMERIC,
                satoshis BIGINT,
                is_explicit BOOLEAN NOT NULL,
                premium DOUBLE PRECISION NOT NULL,
                t0_satoshis BIGINT NOT NULL,
                last_satoshis BIGINT,
                is_fiat_sent BOOLEAN NOT NULL,
                pending_cancel_by UUID REFERENCES users,
                status INT NOT NULL,
                maker_id UUID REFERENCES users,
                taker_id UUID REFERENCES users,
                maker_bond_id UUID REFERENCES ln_payments,
                taker_bond_id UUID REFERENCES ln_payments,
                trade_escrow_id UUID REFERENCES ln_payments,
                buyer_invoice_id UUID REFERENCES ln_payments,
                created TIMESTAMP WITH TIME ZONE NOT NULL,
                expiration TIMESTAMP WITH TIME ZONE NOT NULL,
                revision BIGINT NOT NULL
            )"#,
            r#"CREATE INDEX order_status ON orders (status)"#,
            r#"CREATE INDEX order_maker ON orders (maker_id)"#,
            r#"CREATE INDEX order_taker ON orders (taker_id)"#,
        ],
    }
}
