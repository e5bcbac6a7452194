use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

/// Postgres-only spatial plumbing: converts the EWKT text column into a real
/// PostGIS geometry, installs the runtime geometry parse helper used by
/// compiled fragments, and adds the spatial/JSONB indexes. Other backends
/// keep the text column and never execute spatial predicates.
#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        if manager.get_database_backend() != sea_orm::DatabaseBackend::Postgres {
            return Ok(());
        }
        let conn = manager.get_connection();

        conn.execute_unprepared("CREATE EXTENSION IF NOT EXISTS postgis")
            .await?;

        conn.execute_unprepared(
            r#"
            ALTER TABLE resource
            ALTER COLUMN geometry TYPE geometry(GEOMETRY, 3857)
            USING CASE
                WHEN geometry IS NULL OR trim(geometry) = '' THEN NULL
                ELSE ST_GeomFromEWKT(geometry)
            END
            "#,
        )
        .await?;

        // Runtime geometry parser for request-bound values. Untagged WKT is
        // read as WGS84 lon/lat, matching the in-process evaluator; rule
        // literals never pass through here (the compiler emits explicit
        // constructors for them).
        conn.execute_unprepared(
            r#"
            CREATE OR REPLACE FUNCTION floodgate_parse_geometry(geom_text TEXT)
            RETURNS geometry AS $$
            DECLARE
                srid_part TEXT;
                extracted_srid INT;
            BEGIN
                IF geom_text IS NULL OR trim(geom_text) = '' THEN
                    RETURN NULL;
                END IF;

                geom_text := trim(both '"' FROM trim(geom_text));

                -- GeoJSON (starts with {), assumed WGS84
                IF left(geom_text, 1) = '{' THEN
                    RETURN ST_Transform(ST_SetSRID(ST_GeomFromGeoJSON(geom_text), 4326), 3857);
                END IF;

                -- EWKT carries its own SRID
                IF upper(left(geom_text, 5)) = 'SRID=' THEN
                    srid_part := split_part(geom_text, ';', 1);
                    extracted_srid := substring(srid_part from 6)::int;
                    IF extracted_srid = 3857 THEN
                        RETURN ST_GeomFromEWKT(geom_text);
                    ELSE
                        RETURN ST_Transform(ST_GeomFromEWKT(geom_text), 3857);
                    END IF;
                END IF;

                -- Plain WKT from a request is WGS84 lon/lat
                RETURN ST_Transform(ST_SetSRID(ST_GeomFromText(geom_text), 4326), 3857);
            EXCEPTION WHEN OTHERS THEN
                RETURN NULL;
            END;
            $$ LANGUAGE plpgsql IMMUTABLE
            "#,
        )
        .await?;

        conn.execute_unprepared(
            "CREATE INDEX IF NOT EXISTS idx_resource_geometry ON resource USING GIST (geometry)",
        )
        .await?;
        conn.execute_unprepared(
            "CREATE INDEX IF NOT EXISTS idx_resource_attributes ON resource USING GIN (attributes)",
        )
        .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        if manager.get_database_backend() != sea_orm::DatabaseBackend::Postgres {
            return Ok(());
        }
        let conn = manager.get_connection();
        conn.execute_unprepared("DROP INDEX IF EXISTS idx_resource_attributes")
            .await?;
        conn.execute_unprepared("DROP INDEX IF EXISTS idx_resource_geometry")
            .await?;
        conn.execute_unprepared("DROP FUNCTION IF EXISTS floodgate_parse_geometry(TEXT)")
            .await?;
        conn.execute_unprepared(
            "ALTER TABLE resource ALTER COLUMN geometry TYPE TEXT USING ST_AsEWKT(geometry)",
        )
        .await?;
        Ok(())
    }
}
